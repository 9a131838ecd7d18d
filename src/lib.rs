//! faro - client-side connection pooling and failover driver for
//! Redis-compatible key-value stores
//!
//! The driver pools connections to a set of master and replica servers,
//! resolves which server to use per operation while tolerating topology
//! changes (failover, sentinel-driven master election), and retries
//! transiently-failing operations without corrupting pool state under
//! concurrent access.
//!
//! The main pieces:
//! 1. [`PooledClientManager`]: fixed-size read/write and read-only pools
//!    with a reservation-slot acquisition protocol, async and blocking.
//! 2. [`StaticResolver`] / [`SentinelResolver`]: round-robin endpoint
//!    resolution with master-role verification and full-topology re-probe
//!    on failover.
//! 3. [`DistributedLock`]: cooperative mutual exclusion over a single key
//!    using watch+transaction optimistic concurrency.
//!
//! ```no_run
//! use faro::Config;
//!
//! # async fn demo() -> faro::FaroResult<()> {
//! let manager = Config::default().build_pooled_manager()?;
//! let client = manager.get_client().await?;
//! # drop(client);
//! # Ok(())
//! # }
//! ```
pub mod config;
pub mod core;
pub mod error;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod resolver;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::connection::{
    ConnectionFactory, KvConnection, Reply, TcpConnection, TcpConnectionFactory,
};
pub use crate::core::{ConnectionSettings, Endpoint, ServerRole};
pub use crate::error::{ConfigError, FaroError, FaroResult};
pub use crate::lock::{DistributedLock, LockOptions};
pub use crate::manager::{BasicClientManager, ClientManager, FailoverEvent, FailoverListener};
pub use crate::metrics::{Counter, DriverMetrics, MetricsSink, MetricsSnapshot, NoopMetrics};
pub use crate::pool::{
    ClientGuard, ManagerStats, PoolSettings, PoolStats, PooledClientManager, PooledConnection,
};
pub use crate::resolver::sentinel::{SentinelResolver, SentinelSettings, TopologySource};
pub use crate::resolver::{HostResolver, ResolverSettings, StaticResolver, Topology};
