/// Core value types shared by the resolver, pool, and lock
pub mod connection;

use std::time::Duration;

use crate::error::{FaroError, FaroResult};
use crate::utils::parse_host_port;

/// Default key-value store port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default transport connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default window for master-verification retries.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle window after which a pooled connection is re-established.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 240;

/// Self-reported role of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Master,
    Replica,
    Unknown,
}

impl ServerRole {
    /// Parse a role string as reported by the ROLE command.
    pub fn parse(role: &str) -> Self {
        match role {
            "master" => ServerRole::Master,
            "slave" | "replica" => ServerRole::Replica,
            _ => ServerRole::Unknown,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, ServerRole::Master)
    }
}

/// Immutable descriptor of a server address and its connection parameters.
///
/// Endpoints compare by value across all fields. Topology changes replace
/// whole endpoint lists; an `Endpoint` is never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub auth: Option<String>,
    pub db_index: Option<i64>,
    pub connect_timeout: Duration,
    pub send_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
    pub retry_timeout: Duration,
    pub idle_timeout_secs: u64,
    pub namespace_prefix: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: false,
            auth: None,
            db_index: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: None,
            receive_timeout: None,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            namespace_prefix: None,
        }
    }

    /// Parse a `host[:port]` string into an endpoint with default parameters.
    pub fn parse(address: &str) -> FaroResult<Self> {
        let (host, port) =
            parse_host_port(address, DEFAULT_PORT).map_err(FaroError::config)?;
        Ok(Endpoint::new(host, port))
    }

    /// Parse a list of `host[:port]` strings.
    pub fn parse_many<S: AsRef<str>>(addresses: &[S]) -> FaroResult<Vec<Self>> {
        addresses.iter().map(|a| Endpoint::parse(a.as_ref())).collect()
    }

    /// The `host:port` form used for dialing and log output.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection settings a manager re-applies on every acquisition.
///
/// These mirror the manager-level configuration surface; a pooled
/// connection picks up changes the next time it is handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub send_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
    pub idle_timeout_secs: Option<u64>,
    pub db_index: Option<i64>,
    pub namespace_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("10.0.1.20:7000").unwrap();
        assert_eq!(endpoint.host, "10.0.1.20");
        assert_eq!(endpoint.port, 7000);
        assert_eq!(endpoint.address(), "10.0.1.20:7000");

        let defaulted = Endpoint::parse("redis-master").unwrap();
        assert_eq!(defaulted.port, DEFAULT_PORT);

        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("host:nope").is_err());
    }

    #[test]
    fn test_endpoint_value_equality() {
        let a = Endpoint::parse("127.0.0.1:6379").unwrap();
        let b = Endpoint::parse("127.0.0.1:6379").unwrap();
        assert_eq!(a, b);

        let mut c = b.clone();
        c.db_index = Some(3);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_many() {
        let endpoints =
            Endpoint::parse_many(&["10.0.0.1:6379", "10.0.0.2:6380", "10.0.0.3"]).unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[1].port, 6380);
        assert_eq!(endpoints[2].port, DEFAULT_PORT);

        assert!(Endpoint::parse_many(&["ok:6379", ""]).is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(ServerRole::parse("master"), ServerRole::Master);
        assert_eq!(ServerRole::parse("slave"), ServerRole::Replica);
        assert_eq!(ServerRole::parse("replica"), ServerRole::Replica);
        assert_eq!(ServerRole::parse("sentinel"), ServerRole::Unknown);
        assert!(ServerRole::parse("master").is_master());
    }
}
