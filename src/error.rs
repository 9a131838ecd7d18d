/// Unified error handling for the faro driver
///
/// This module provides the error type system covering all failure
/// scenarios in the driver: configuration errors, pool exhaustion,
/// topology/verification failures, transient connection errors, and
/// distributed lock timeouts.
use std::io;
use thiserror::Error;

/// Main error type for faro driver operations
#[derive(Debug, Error)]
pub enum FaroError {
    /// Configuration errors (fatal, not retried)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Waited longer than the configured pool timeout for a free slot
    #[error("Pool timeout: waited {waited_ms}ms for a connection slot; all pooled connections may be in use")]
    PoolTimeout { waited_ms: u64 },

    /// A full-topology re-probe found zero masters
    #[error("No master found after probing {probed} hosts")]
    NoMasterFound { probed: usize },

    /// Master-role verification retried until the retry timeout elapsed
    #[error("Master verification for {host} timed out after {elapsed_ms}ms")]
    VerificationTimeout { host: String, elapsed_ms: u64 },

    /// Transient connection failures during connection creation
    #[error("Connection error to {host}: {message}")]
    Connection { host: String, message: String },

    /// Distributed lock not obtained within the requested timeout
    #[error("Lock timeout: could not acquire '{key}' within {timeout_ms}ms")]
    LockTimeout { key: String, timeout_ms: u64 },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for faro operations
pub type FaroResult<T> = Result<T, FaroError>;

/// Convenience methods for creating specific error types
impl FaroError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        FaroError::Protocol(message.into())
    }

    /// Create a transient connection error
    pub fn connection<S: Into<String>>(host: S, message: S) -> Self {
        FaroError::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a configuration validation error
    pub fn config<S: Into<String>>(message: S) -> Self {
        FaroError::Config(ConfigError::ValidationError(message.into()))
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        FaroError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (safe to retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            FaroError::Io(_) => true,
            FaroError::Connection { .. } => true,
            FaroError::PoolTimeout { .. } => true,
            FaroError::VerificationTimeout { .. } => true,
            FaroError::LockTimeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = FaroError::connection("10.0.0.1:6379", "connection refused");
        assert!(matches!(error, FaroError::Connection { .. }));
        assert_eq!(
            error.to_string(),
            "Connection error to 10.0.0.1:6379: connection refused"
        );
    }

    #[test]
    fn test_error_recoverability() {
        let network_error = FaroError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert!(network_error.is_recoverable());

        let config_error = FaroError::config("empty master list");
        assert!(!config_error.is_recoverable());

        let no_master = FaroError::NoMasterFound { probed: 3 };
        assert!(!no_master.is_recoverable());
    }

    #[test]
    fn test_pool_timeout_message() {
        let error = FaroError::PoolTimeout { waited_ms: 2000 };
        assert!(error.to_string().contains("2000ms"));
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_lock_timeout_message() {
        let error = FaroError::LockTimeout {
            key: "jobs:nightly".to_string(),
            timeout_ms: 200,
        };
        assert!(error.to_string().contains("jobs:nightly"));
    }
}
