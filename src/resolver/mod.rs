/// Host resolution: mapping round-robin indices onto the current topology
///
/// A resolver owns the ordered master/replica endpoint lists and turns a
/// monotonically increasing "desired index" into a concrete endpoint. The
/// topology is replaced wholesale, never mutated, so a reader that captured
/// an `Arc<Topology>` before a failover keeps a consistent (if stale) view.
pub mod sentinel;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::connection::{ConnectionFactory, KvConnection};
use crate::core::Endpoint;
use crate::error::{FaroError, FaroResult};
use crate::metrics::{Counter, MetricsSink, NoopMetrics};
use crate::utils::jittered_backoff;

/// Current master/replica endpoint lists.
///
/// Invariant: `masters` is non-empty. `replicas` may be empty, in which
/// case read-only resolution falls back to the masters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub masters: Vec<Endpoint>,
    pub replicas: Vec<Endpoint>,
}

impl Topology {
    pub fn new(masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<Self> {
        if masters.is_empty() {
            return Err(FaroError::config("master endpoint list cannot be empty"));
        }
        Ok(Topology { masters, replicas })
    }
}

/// Resolver behavior settings.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Confirm a host self-reports the master role before handing out a
    /// master connection.
    pub verify_masters: bool,
    /// Retry master verification with backoff (bounded by the endpoint's
    /// `retry_timeout`) when the probe itself fails.
    pub retry_on_failed_masters: bool,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            verify_masters: true,
            retry_on_failed_masters: true,
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(1),
        }
    }
}

/// Maps desired indices to endpoints and creates role-checked connections.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Snapshot of the current topology.
    fn topology(&self) -> Arc<Topology>;

    /// `masters[index % masters.len()]`. Pure, no I/O.
    fn read_write_host(&self, index: usize) -> Endpoint;

    /// `replicas[index % replicas.len()]`, falling back to the masters
    /// when no replicas are configured. Pure, no I/O.
    fn read_only_host(&self, index: usize) -> Endpoint;

    fn read_write_host_count(&self) -> usize;

    fn read_only_host_count(&self) -> usize;

    /// Replace the master list. Empty lists are a configuration error.
    fn reset_masters(&self, masters: Vec<Endpoint>) -> FaroResult<()>;

    /// Replace the replica list. Empty is permitted.
    fn reset_replicas(&self, replicas: Vec<Endpoint>);

    /// Replace both lists in one critical section so concurrent readers
    /// never observe mismatched master/replica generations.
    fn reset_topology(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()>;

    /// Resolve the indexed master and connect, verifying the role when
    /// verification is enabled.
    async fn create_master_connection(&self, index: usize) -> FaroResult<Box<dyn KvConnection>>;

    /// Resolve the indexed replica (or fallback master) and connect.
    async fn create_replica_connection(&self, index: usize) -> FaroResult<Box<dyn KvConnection>>;
}

/// Resolver over statically configured host lists.
pub struct StaticResolver {
    topology: RwLock<Arc<Topology>>,
    factory: Arc<dyn ConnectionFactory>,
    metrics: Arc<dyn MetricsSink>,
    settings: ResolverSettings,
}

impl StaticResolver {
    pub fn new(
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> FaroResult<Self> {
        Self::with_settings(
            masters,
            replicas,
            factory,
            ResolverSettings::default(),
            Arc::new(NoopMetrics),
        )
    }

    pub fn with_settings(
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        factory: Arc<dyn ConnectionFactory>,
        settings: ResolverSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> FaroResult<Self> {
        let topology = Topology::new(masters, replicas)?;
        Ok(StaticResolver {
            topology: RwLock::new(Arc::new(topology)),
            factory,
            metrics,
            settings,
        })
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    pub(crate) fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    fn swap_topology(&self, topology: Topology) {
        let mut slot = self
            .topology
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(topology);
    }

    /// Connect to `endpoint` and confirm it self-reports the master role.
    ///
    /// Role mismatch triggers a full topology re-probe; probe failures are
    /// retried with jittered backoff while `retry_on_failed_masters` is
    /// set, bounded by the endpoint's `retry_timeout`.
    pub(crate) async fn connect_verified_master(
        &self,
        endpoint: &Endpoint,
    ) -> FaroResult<Box<dyn KvConnection>> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.probe_master(endpoint).await {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => {
                    self.metrics.incr(Counter::InvalidMasters);
                    warn!(
                        "Host {} no longer reports master role; re-probing topology",
                        endpoint
                    );
                    return self.reprobe_topology().await;
                }
                Err(err) if self.settings.retry_on_failed_masters => {
                    let elapsed = started.elapsed();
                    if elapsed >= endpoint.retry_timeout {
                        warn!(
                            "Master verification for {} gave up after {:?}: {}",
                            endpoint, elapsed, err
                        );
                        return Err(FaroError::VerificationTimeout {
                            host: endpoint.address(),
                            elapsed_ms: elapsed.as_millis() as u64,
                        });
                    }
                    self.metrics.incr(Counter::Retries);
                    let delay = jittered_backoff(
                        attempt,
                        self.settings.backoff_base,
                        self.settings.backoff_cap,
                    );
                    debug!(
                        "Master verification for {} failed ({}); retrying in {:?}",
                        endpoint, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns `Ok(None)` when the host answered but is not a master.
    pub(crate) async fn probe_master(
        &self,
        endpoint: &Endpoint,
    ) -> FaroResult<Option<Box<dyn KvConnection>>> {
        let mut conn = self.factory.connect(endpoint).await?;
        if conn.role().await?.is_master() {
            Ok(Some(conn))
        } else {
            Ok(None)
        }
    }

    /// Probe every known host, partition by reported role, install the
    /// fresh partition as the new topology, and return a connection to the
    /// first discovered master.
    pub(crate) async fn reprobe_topology(&self) -> FaroResult<Box<dyn KvConnection>> {
        let topology = self.topology();
        let mut hosts: Vec<Endpoint> = Vec::new();
        for host in topology.masters.iter().chain(topology.replicas.iter()) {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }

        let probed = hosts.len();
        let mut masters = Vec::new();
        let mut replicas = Vec::new();
        let mut master_conn: Option<Box<dyn KvConnection>> = None;

        for host in hosts {
            match self.factory.connect(&host).await {
                Ok(mut conn) => match conn.role().await {
                    Ok(role) if role.is_master() => {
                        if master_conn.is_none() {
                            master_conn = Some(conn);
                        }
                        masters.push(host);
                    }
                    Ok(_) => replicas.push(host),
                    Err(e) => debug!("Role probe failed for {}: {}", host, e),
                },
                Err(e) => debug!("Probe connect failed for {}: {}", host, e),
            }
        }

        match master_conn {
            Some(conn) => {
                info!(
                    "Topology re-probe recovered {} master(s) and {} replica(s)",
                    masters.len(),
                    replicas.len()
                );
                self.reset_topology(masters, replicas)?;
                Ok(conn)
            }
            None => Err(FaroError::NoMasterFound { probed }),
        }
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    fn topology(&self) -> Arc<Topology> {
        self.topology
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn read_write_host(&self, index: usize) -> Endpoint {
        let topology = self.topology();
        topology.masters[index % topology.masters.len()].clone()
    }

    fn read_only_host(&self, index: usize) -> Endpoint {
        let topology = self.topology();
        if topology.replicas.is_empty() {
            topology.masters[index % topology.masters.len()].clone()
        } else {
            topology.replicas[index % topology.replicas.len()].clone()
        }
    }

    fn read_write_host_count(&self) -> usize {
        self.topology().masters.len()
    }

    fn read_only_host_count(&self) -> usize {
        let topology = self.topology();
        if topology.replicas.is_empty() {
            topology.masters.len()
        } else {
            topology.replicas.len()
        }
    }

    fn reset_masters(&self, masters: Vec<Endpoint>) -> FaroResult<()> {
        let replicas = self.topology().replicas.clone();
        self.swap_topology(Topology::new(masters, replicas)?);
        Ok(())
    }

    fn reset_replicas(&self, replicas: Vec<Endpoint>) {
        let masters = self.topology().masters.clone();
        // Masters are untouched and were non-empty; this cannot fail.
        self.swap_topology(Topology { masters, replicas });
    }

    fn reset_topology(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()> {
        self.swap_topology(Topology::new(masters, replicas)?);
        Ok(())
    }

    async fn create_master_connection(&self, index: usize) -> FaroResult<Box<dyn KvConnection>> {
        let endpoint = self.read_write_host(index);
        if !self.settings.verify_masters {
            return self.factory.connect(&endpoint).await;
        }
        self.connect_verified_master(&endpoint).await
    }

    async fn create_replica_connection(&self, index: usize) -> FaroResult<Box<dyn KvConnection>> {
        let endpoint = self.read_only_host(index);
        self.factory.connect(&endpoint).await
    }
}
