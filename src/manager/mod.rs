/// Client manager contract and the basic (non-pooling) manager
///
/// Both managers resolve endpoints through a [`HostResolver`] and share
/// the failover coordination behavior: `failover_to` swaps the resolver's
/// topology in one critical section, resets the round-robin indices, bumps
/// the failover counter, and invokes registered listeners synchronously in
/// registration order with per-listener error isolation.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{error, info};

use crate::core::{ConnectionSettings, Endpoint};
use crate::error::FaroResult;
use crate::metrics::{Counter, DriverMetrics, MetricsSink, MetricsSnapshot};
use crate::pool::{ClientGuard, PooledConnection};
use crate::resolver::HostResolver;

/// Payload handed to failover listeners after a topology swap completed.
#[derive(Debug, Clone)]
pub struct FailoverEvent {
    pub masters: Vec<Endpoint>,
    pub replicas: Vec<Endpoint>,
    pub total_failovers: u64,
}

/// Callback invoked synchronously after every failover. Errors are logged
/// and never abort the swap or the remaining listeners.
pub type FailoverListener = Box<dyn Fn(&FailoverEvent) -> FaroResult<()> + Send + Sync>;

/// Common surface of the pooling and non-pooling managers.
#[async_trait]
pub trait ClientManager: Send + Sync {
    /// A ready-to-use read/write connection.
    async fn get_client(&self) -> FaroResult<ClientGuard>;

    /// A ready-to-use read-only connection.
    async fn get_read_only_client(&self) -> FaroResult<ClientGuard>;

    /// Administrative topology switch.
    fn failover_to(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()>;

    /// Register a failover listener.
    fn on_failover(&self, listener: FailoverListener);
}

struct BasicInner {
    resolver: Arc<dyn HostResolver>,
    settings: ConnectionSettings,
    metrics: Arc<DriverMetrics>,
    listeners: Mutex<Vec<FailoverListener>>,
    write_index: AtomicU64,
    read_index: AtomicU64,
    client_counter: AtomicU64,
}

/// Manager creating a fresh connection for every acquisition.
///
/// The round-robin indices are the only shared mutable state; connections
/// are never tracked after they are handed out.
#[derive(Clone)]
pub struct BasicClientManager {
    inner: Arc<BasicInner>,
}

impl BasicClientManager {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self::with_settings(
            resolver,
            ConnectionSettings::default(),
            Arc::new(DriverMetrics::new()),
        )
    }

    pub fn with_settings(
        resolver: Arc<dyn HostResolver>,
        settings: ConnectionSettings,
        metrics: Arc<DriverMetrics>,
    ) -> Self {
        BasicClientManager {
            inner: Arc::new(BasicInner {
                resolver,
                settings,
                metrics,
                listeners: Mutex::new(Vec::new()),
                write_index: AtomicU64::new(0),
                read_index: AtomicU64::new(0),
                client_counter: AtomicU64::new(0),
            }),
        }
    }

    pub async fn get_client(&self) -> FaroResult<ClientGuard> {
        let inner = &self.inner;
        let index = inner.write_index.fetch_add(1, Ordering::SeqCst) as usize;
        let mut conn = inner.resolver.create_master_connection(index).await?;
        conn.apply_settings(&inner.settings);
        inner.metrics.incr(Counter::ClientsCreated);
        let id = inner.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        ClientGuard::unpooled(Arc::new(PooledConnection::new(id, conn)))
    }

    pub async fn get_read_only_client(&self) -> FaroResult<ClientGuard> {
        let inner = &self.inner;
        let index = inner.read_index.fetch_add(1, Ordering::SeqCst) as usize;
        let mut conn = inner.resolver.create_replica_connection(index).await?;
        conn.apply_settings(&inner.settings);
        inner.metrics.incr(Counter::ClientsCreated);
        let id = inner.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        ClientGuard::unpooled(Arc::new(PooledConnection::new(id, conn)))
    }

    pub fn failover_to(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()> {
        let inner = &self.inner;
        inner.metrics.incr(Counter::Failovers);
        info!(
            "FailoverTo: masters=[{}] replicas=[{}]",
            masters
                .iter()
                .map(Endpoint::address)
                .collect::<Vec<_>>()
                .join(","),
            replicas
                .iter()
                .map(Endpoint::address)
                .collect::<Vec<_>>()
                .join(",")
        );

        inner
            .resolver
            .reset_topology(masters.clone(), replicas.clone())?;
        inner.write_index.store(0, Ordering::SeqCst);
        inner.read_index.store(0, Ordering::SeqCst);

        let event = FailoverEvent {
            masters,
            replicas,
            total_failovers: inner.metrics.get(Counter::Failovers),
        };
        let listeners = inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (i, listener) in listeners.iter().enumerate() {
            if let Err(e) = listener(&event) {
                error!("Failover listener {} failed: {}", i, e);
            }
        }
        Ok(())
    }

    pub fn on_failover(&self, listener: FailoverListener) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

#[async_trait]
impl ClientManager for BasicClientManager {
    async fn get_client(&self) -> FaroResult<ClientGuard> {
        BasicClientManager::get_client(self).await
    }

    async fn get_read_only_client(&self) -> FaroResult<ClientGuard> {
        BasicClientManager::get_read_only_client(self).await
    }

    fn failover_to(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()> {
        BasicClientManager::failover_to(self, masters, replicas)
    }

    fn on_failover(&self, listener: FailoverListener) {
        BasicClientManager::on_failover(self, listener)
    }
}
