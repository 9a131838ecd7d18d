/// Configuration management for the faro driver
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::connection::TcpConnectionFactory;
use crate::core::{ConnectionSettings, Endpoint};
use crate::error::ConfigError;
use crate::metrics::DriverMetrics;
use crate::pool::{PoolSettings, PooledClientManager};
use crate::resolver::{ResolverSettings, StaticResolver};

/// Main driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master and replica host lists
    pub hosts: HostsConfig,
    /// Pool sizing and wait behavior
    pub pool: PoolConfig,
    /// Per-connection parameters
    pub connection: ConnectionConfig,
    /// Resolver verification behavior
    pub resolver: ResolverConfig,
}

/// Host lists in `host[:port]` form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Write-capable hosts (at least one required)
    pub masters: Vec<String>,
    /// Read-only hosts; empty falls back to the masters
    pub replicas: Vec<String>,
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Explicit read/write pool size; derived from host count when absent
    pub max_write_pool_size: Option<usize>,
    /// Explicit read-only pool size; derived from host count when absent
    pub max_read_pool_size: Option<usize>,
    /// Slots per host when sizes are derived
    pub pool_size_multiplier: usize,
    /// Maximum wait for a free slot in milliseconds; 0 waits forever
    pub pool_timeout_ms: u64,
    /// Re-scan cadence for the wait-forever mode
    pub recheck_interval_ms: u64,
    /// Delay before deactivated connections are disposed; 0 is immediate
    pub deactivated_expiry_ms: u64,
    /// Allocate pools at construction
    pub auto_start: bool,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Socket send timeout in milliseconds (optional)
    pub send_timeout_ms: Option<u64>,
    /// Socket receive timeout in milliseconds (optional)
    pub receive_timeout_ms: Option<u64>,
    /// Master-verification retry window in milliseconds
    pub retry_timeout_ms: u64,
    /// Idle window after which a connection is re-established
    pub idle_timeout_secs: u64,
    /// Database index selected on connect
    pub db_index: Option<i64>,
    /// Prefix applied to every key
    pub namespace_prefix: Option<String>,
    /// Connect over TLS (requires a TLS-capable connection factory)
    pub use_tls: bool,
    /// AUTH credential
    pub auth: Option<String>,
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Confirm master role before handing out master connections
    pub verify_masters: bool,
    /// Retry verification with backoff when the probe itself fails
    pub retry_on_failed_masters: bool,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            masters: vec!["127.0.0.1:6379".to_string()],
            replicas: Vec::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_write_pool_size: None,
            max_read_pool_size: None,
            pool_size_multiplier: 20,
            pool_timeout_ms: 2000,
            recheck_interval_ms: 100,
            deactivated_expiry_ms: 10_000,
            auto_start: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            send_timeout_ms: None,
            receive_timeout_ms: None,
            retry_timeout_ms: 10_000,
            idle_timeout_secs: 240,
            db_index: None,
            namespace_prefix: None,
            use_tls: false,
            auth: None,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            verify_masters: true,
            retry_on_failed_masters: true,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.masters.is_empty() {
            return Err(ConfigError::ValidationError(
                "hosts.masters cannot be empty".to_string(),
            ));
        }

        for host in self.hosts.masters.iter().chain(self.hosts.replicas.iter()) {
            Endpoint::parse(host).map_err(|_| {
                ConfigError::ValidationError(format!("Invalid host: {}", host))
            })?;
        }

        if self.pool.pool_size_multiplier == 0 {
            return Err(ConfigError::ValidationError(
                "pool_size_multiplier must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_write_pool_size == Some(0) || self.pool.max_read_pool_size == Some(0) {
            return Err(ConfigError::ValidationError(
                "explicit pool sizes must be greater than 0".to_string(),
            ));
        }

        if self.pool.recheck_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "recheck_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn endpoint_for(&self, host: &str) -> Result<Endpoint, ConfigError> {
        let mut endpoint = Endpoint::parse(host)
            .map_err(|_| ConfigError::ValidationError(format!("Invalid host: {}", host)))?;
        let conn = &self.connection;
        endpoint.use_tls = conn.use_tls;
        endpoint.auth = conn.auth.clone();
        endpoint.db_index = conn.db_index;
        endpoint.connect_timeout = Duration::from_millis(conn.connect_timeout_ms);
        endpoint.send_timeout = conn.send_timeout_ms.map(Duration::from_millis);
        endpoint.receive_timeout = conn.receive_timeout_ms.map(Duration::from_millis);
        endpoint.retry_timeout = Duration::from_millis(conn.retry_timeout_ms);
        endpoint.idle_timeout_secs = conn.idle_timeout_secs;
        endpoint.namespace_prefix = conn.namespace_prefix.clone();
        Ok(endpoint)
    }

    /// Master endpoints with connection parameters applied.
    pub fn master_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.hosts
            .masters
            .iter()
            .map(|h| self.endpoint_for(h))
            .collect()
    }

    /// Replica endpoints with connection parameters applied.
    pub fn replica_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.hosts
            .replicas
            .iter()
            .map(|h| self.endpoint_for(h))
            .collect()
    }

    /// Pool settings derived from this configuration. Absent pool sizes
    /// default to `host count * pool_size_multiplier`; a zero pool
    /// timeout means wait forever.
    pub fn pool_settings(&self) -> PoolSettings {
        let write_hosts = self.hosts.masters.len();
        let read_hosts = if self.hosts.replicas.is_empty() {
            write_hosts
        } else {
            self.hosts.replicas.len()
        };

        PoolSettings {
            max_write_pool_size: self
                .pool
                .max_write_pool_size
                .unwrap_or(write_hosts * self.pool.pool_size_multiplier),
            max_read_pool_size: self
                .pool
                .max_read_pool_size
                .unwrap_or(read_hosts * self.pool.pool_size_multiplier),
            pool_timeout: match self.pool.pool_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            recheck_interval: Duration::from_millis(self.pool.recheck_interval_ms),
            deactivated_expiry: Duration::from_millis(self.pool.deactivated_expiry_ms),
            auto_start: self.pool.auto_start,
            connection: self.connection_settings(),
        }
    }

    /// Settings re-applied to pooled connections on every acquisition.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            send_timeout: self.connection.send_timeout_ms.map(Duration::from_millis),
            receive_timeout: self
                .connection
                .receive_timeout_ms
                .map(Duration::from_millis),
            idle_timeout_secs: Some(self.connection.idle_timeout_secs),
            db_index: self.connection.db_index,
            namespace_prefix: self.connection.namespace_prefix.clone(),
        }
    }

    /// Resolver settings derived from this configuration.
    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            verify_masters: self.resolver.verify_masters,
            retry_on_failed_masters: self.resolver.retry_on_failed_masters,
            ..Default::default()
        }
    }

    /// Assemble a pooled manager over TCP connections from this
    /// configuration. No connection is opened until the first acquisition.
    pub fn build_pooled_manager(&self) -> Result<PooledClientManager, crate::error::FaroError> {
        self.validate()?;
        let metrics = Arc::new(DriverMetrics::new());
        let resolver = StaticResolver::with_settings(
            self.master_endpoints()?,
            self.replica_endpoints()?,
            Arc::new(TcpConnectionFactory),
            self.resolver_settings(),
            metrics.clone(),
        )?;
        PooledClientManager::with_metrics(Arc::new(resolver), self.pool_settings(), metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.hosts.masters = Vec::new();
        assert!(config.validate().is_err());

        config.hosts.masters = vec!["10.0.0.1:6379".to_string()];
        assert!(config.validate().is_ok());

        config.hosts.replicas = vec!["not a host:port:extra".to_string()];
        assert!(config.validate().is_err());

        config.hosts.replicas = Vec::new();
        config.pool.pool_size_multiplier = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = Config::default();
        config.hosts.masters = vec!["10.0.0.1:6379".to_string(), "10.0.0.2:6379".to_string()];
        config.pool.pool_timeout_ms = 0;
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.hosts.masters.len(), 2);
        assert_eq!(loaded.pool.pool_timeout_ms, 0);
    }

    #[test]
    fn test_pool_settings_derivation() {
        let mut config = Config::default();
        config.hosts.masters = vec!["10.0.0.1:6379".to_string(), "10.0.0.2:6379".to_string()];

        let settings = config.pool_settings();
        // Two masters at the default multiplier of 20.
        assert_eq!(settings.max_write_pool_size, 40);
        // No replicas: the read pool falls back to master count.
        assert_eq!(settings.max_read_pool_size, 40);
        assert_eq!(settings.pool_timeout, Some(Duration::from_millis(2000)));

        config.pool.max_write_pool_size = Some(3);
        config.pool.pool_timeout_ms = 0;
        let settings = config.pool_settings();
        assert_eq!(settings.max_write_pool_size, 3);
        assert_eq!(settings.pool_timeout, None);
    }

    #[test]
    fn test_endpoints_carry_connection_parameters() {
        let mut config = Config::default();
        config.connection.auth = Some("hunter2".to_string());
        config.connection.db_index = Some(3);
        config.connection.namespace_prefix = Some("app:".to_string());
        config.connection.connect_timeout_ms = 1500;

        let endpoints = config.master_endpoints().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].auth.as_deref(), Some("hunter2"));
        assert_eq!(endpoints[0].db_index, Some(3));
        assert_eq!(endpoints[0].namespace_prefix.as_deref(), Some("app:"));
        assert_eq!(endpoints[0].connect_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_build_pooled_manager() {
        let config = Config::default();
        let manager = config.build_pooled_manager().unwrap();
        // Pools are allocated but no connection has been opened yet.
        let stats = manager.stats();
        assert_eq!(stats.write.pool_size, 20);
        assert_eq!(stats.counters.clients_created, 0);
    }
}
