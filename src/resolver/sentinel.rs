/// Sentinel-backed host resolution
///
/// The resolver depends only on the narrow [`TopologySource`] interface; a
/// sentinel client implements it by answering master/replica queries and
/// accepting forced-failover requests. Live sentinel answers are folded
/// into the cached topology whenever a connection is created, so the pure
/// index-to-endpoint methods keep serving the latest known lists without
/// performing I/O; the cache is also the fallback when the sentinel is
/// unreachable.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::connection::{ConnectionFactory, KvConnection};
use crate::core::Endpoint;
use crate::error::FaroResult;
use crate::metrics::{Counter, MetricsSink, NoopMetrics};
use crate::resolver::{HostResolver, ResolverSettings, StaticResolver, Topology};
use crate::utils::jittered_backoff;

/// Live topology authority, typically a sentinel quorum client.
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// The current master endpoint according to the source.
    async fn current_master(&self) -> FaroResult<Endpoint>;

    /// The current replica endpoints according to the source.
    async fn current_replicas(&self) -> FaroResult<Vec<Endpoint>>;

    /// Request a failover vote for the monitored master.
    async fn force_failover(&self) -> FaroResult<()>;
}

/// Escalation policy for sentinel-backed master verification.
#[derive(Debug, Clone)]
pub struct SentinelSettings {
    /// How long verification of one host may stall before a failover vote
    /// is requested from the source.
    pub stall_window: Duration,
    /// Sleep after requesting a failover, giving the vote time to settle.
    pub failover_wait: Duration,
    /// Total ceiling; past it the resolver falls back to a full topology
    /// re-probe.
    pub max_wait: Duration,
}

impl Default for SentinelSettings {
    fn default() -> Self {
        Self {
            stall_window: Duration::from_secs(1),
            failover_wait: Duration::from_millis(250),
            max_wait: Duration::from_secs(15),
        }
    }
}

/// Resolver deferring endpoint selection to a live [`TopologySource`],
/// with the cached static lists as fallback.
pub struct SentinelResolver {
    cached: StaticResolver,
    source: Arc<dyn TopologySource>,
    settings: SentinelSettings,
    metrics: Arc<dyn MetricsSink>,
}

impl SentinelResolver {
    pub fn new(
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        factory: Arc<dyn ConnectionFactory>,
        source: Arc<dyn TopologySource>,
    ) -> FaroResult<Self> {
        Self::with_settings(
            masters,
            replicas,
            factory,
            source,
            ResolverSettings::default(),
            SentinelSettings::default(),
            Arc::new(NoopMetrics),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_settings(
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        factory: Arc<dyn ConnectionFactory>,
        source: Arc<dyn TopologySource>,
        resolver_settings: ResolverSettings,
        settings: SentinelSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> FaroResult<Self> {
        let cached = StaticResolver::with_settings(
            masters,
            replicas,
            factory,
            resolver_settings,
            metrics.clone(),
        )?;
        Ok(SentinelResolver {
            cached,
            source,
            settings,
            metrics,
        })
    }

    /// Ask the source for the current master, folding the answer into the
    /// cached topology; fall back to the cached lists when unreachable.
    async fn refreshed_master(&self, index: usize) -> Endpoint {
        match self.source.current_master().await {
            Ok(master) => {
                let current = self.cached.topology();
                if current.masters.len() != 1 || current.masters[0] != master {
                    debug!("Sentinel reports master {}", master);
                    let _ = self.cached.reset_masters(vec![master.clone()]);
                }
                master
            }
            Err(e) => {
                debug!("Sentinel master query failed ({}); using cached topology", e);
                self.cached.read_write_host(index)
            }
        }
    }

    async fn refreshed_replica(&self, index: usize) -> Endpoint {
        match self.source.current_replicas().await {
            Ok(replicas) if !replicas.is_empty() => {
                let current = self.cached.topology();
                if current.replicas != replicas {
                    debug!("Sentinel reports {} replica(s)", replicas.len());
                    self.cached.reset_replicas(replicas.clone());
                }
                replicas[index % replicas.len()].clone()
            }
            Ok(_) => self.cached.read_only_host(index),
            Err(e) => {
                debug!(
                    "Sentinel replica query failed ({}); using cached topology",
                    e
                );
                self.cached.read_only_host(index)
            }
        }
    }
}

#[async_trait]
impl HostResolver for SentinelResolver {
    fn topology(&self) -> Arc<Topology> {
        self.cached.topology()
    }

    fn read_write_host(&self, index: usize) -> Endpoint {
        self.cached.read_write_host(index)
    }

    fn read_only_host(&self, index: usize) -> Endpoint {
        self.cached.read_only_host(index)
    }

    fn read_write_host_count(&self) -> usize {
        self.cached.read_write_host_count()
    }

    fn read_only_host_count(&self) -> usize {
        self.cached.read_only_host_count()
    }

    fn reset_masters(&self, masters: Vec<Endpoint>) -> FaroResult<()> {
        self.cached.reset_masters(masters)
    }

    fn reset_replicas(&self, replicas: Vec<Endpoint>) {
        self.cached.reset_replicas(replicas)
    }

    fn reset_topology(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()> {
        self.cached.reset_topology(masters, replicas)
    }

    async fn create_master_connection(&self, index: usize) -> FaroResult<Box<dyn KvConnection>> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let endpoint = self.refreshed_master(index).await;

            if !self.cached.settings().verify_masters {
                return self.cached.factory().connect(&endpoint).await;
            }

            let failure = match self.cached.probe_master(&endpoint).await {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => format!("{} reports a non-master role", endpoint),
                Err(e) => format!("probe of {} failed: {}", endpoint, e),
            };

            let elapsed = started.elapsed();
            if elapsed >= self.settings.max_wait {
                warn!(
                    "Sentinel-backed verification stalled for {:?} ({}); falling back to full topology re-probe",
                    elapsed, failure
                );
                return self.cached.reprobe_topology().await;
            }

            if elapsed >= self.settings.stall_window {
                info!(
                    "Master verification stalled ({}); requesting failover vote",
                    failure
                );
                self.metrics.incr(Counter::ForcedFailovers);
                if let Err(e) = self.source.force_failover().await {
                    warn!("Forced failover request failed: {}", e);
                }
                sleep(self.settings.failover_wait).await;
            } else {
                self.metrics.incr(Counter::Retries);
                sleep(jittered_backoff(
                    attempt,
                    self.cached.settings().backoff_base,
                    self.cached.settings().backoff_cap,
                ))
                .await;
            }
            attempt += 1;
        }
    }

    async fn create_replica_connection(&self, index: usize) -> FaroResult<Box<dyn KvConnection>> {
        let endpoint = self.refreshed_replica(index).await;
        self.cached.factory().connect(&endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServerRole;
    use crate::error::FaroError;
    use crate::resolver::tests::FakeFactory;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        master: Mutex<Endpoint>,
        replicas: Mutex<Vec<Endpoint>>,
        unreachable: AtomicBool,
        failovers: AtomicUsize,
        /// Factory whose roles a forced failover flips.
        factory: Arc<FakeFactory>,
        promote_on_failover: Option<String>,
    }

    #[async_trait]
    impl TopologySource for FakeSource {
        async fn current_master(&self) -> FaroResult<Endpoint> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(FaroError::connection("sentinel", "unreachable"));
            }
            Ok(self.master.lock().unwrap().clone())
        }

        async fn current_replicas(&self) -> FaroResult<Vec<Endpoint>> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(FaroError::connection("sentinel", "unreachable"));
            }
            Ok(self.replicas.lock().unwrap().clone())
        }

        async fn force_failover(&self) -> FaroResult<()> {
            self.failovers.fetch_add(1, Ordering::SeqCst);
            if let Some(address) = &self.promote_on_failover {
                self.factory.set_role(address, ServerRole::Master);
            }
            Ok(())
        }
    }

    fn endpoints(addresses: &[&str]) -> Vec<Endpoint> {
        Endpoint::parse_many(addresses).unwrap()
    }

    fn fast_sentinel_settings() -> SentinelSettings {
        SentinelSettings {
            stall_window: Duration::from_millis(10),
            failover_wait: Duration::from_millis(5),
            max_wait: Duration::from_millis(500),
        }
    }

    fn fast_resolver_settings() -> ResolverSettings {
        ResolverSettings {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn build(
        factory: Arc<FakeFactory>,
        source: Arc<FakeSource>,
        cached_masters: &[&str],
        cached_replicas: &[&str],
        settings: SentinelSettings,
    ) -> SentinelResolver {
        SentinelResolver::with_settings(
            endpoints(cached_masters),
            endpoints(cached_replicas),
            factory,
            source,
            fast_resolver_settings(),
            settings,
            Arc::new(NoopMetrics),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_prefers_live_sentinel_answer() {
        let factory = FakeFactory::with_roles(&[
            ("10.0.0.1:6379", ServerRole::Replica),
            ("10.0.0.2:6379", ServerRole::Master),
        ]);
        let source = Arc::new(FakeSource {
            master: Mutex::new(Endpoint::parse("10.0.0.2:6379").unwrap()),
            replicas: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            failovers: AtomicUsize::new(0),
            factory: factory.clone(),
            promote_on_failover: None,
        });

        let resolver = build(
            factory,
            source,
            &["10.0.0.1:6379"],
            &[],
            fast_sentinel_settings(),
        );

        let conn = resolver.create_master_connection(0).await.unwrap();
        assert_eq!(conn.endpoint().address(), "10.0.0.2:6379");
        // The live answer was folded into the cache.
        assert_eq!(
            resolver.topology().masters,
            endpoints(&["10.0.0.2:6379"])
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_cache_when_sentinel_unreachable() {
        let factory = FakeFactory::with_roles(&[("10.0.0.1:6379", ServerRole::Master)]);
        let source = Arc::new(FakeSource {
            master: Mutex::new(Endpoint::parse("10.0.0.9:6379").unwrap()),
            replicas: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(true),
            failovers: AtomicUsize::new(0),
            factory: factory.clone(),
            promote_on_failover: None,
        });

        let resolver = build(
            factory,
            source,
            &["10.0.0.1:6379"],
            &[],
            fast_sentinel_settings(),
        );

        let conn = resolver.create_master_connection(0).await.unwrap();
        assert_eq!(conn.endpoint().address(), "10.0.0.1:6379");
    }

    #[tokio::test]
    async fn test_stall_escalates_to_forced_failover() {
        // The sentinel keeps reporting a host that answers as replica;
        // after the stall window a failover vote promotes it.
        let factory = FakeFactory::with_roles(&[("10.0.0.1:6379", ServerRole::Replica)]);
        let source = Arc::new(FakeSource {
            master: Mutex::new(Endpoint::parse("10.0.0.1:6379").unwrap()),
            replicas: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            failovers: AtomicUsize::new(0),
            factory: factory.clone(),
            promote_on_failover: Some("10.0.0.1:6379".to_string()),
        });

        let resolver = build(
            factory,
            source.clone(),
            &["10.0.0.1:6379"],
            &[],
            fast_sentinel_settings(),
        );

        let conn = resolver.create_master_connection(0).await.unwrap();
        assert_eq!(conn.endpoint().address(), "10.0.0.1:6379");
        assert!(source.failovers.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_max_wait_falls_back_to_reprobe() {
        // Forced failovers never help; past the ceiling the resolver
        // re-probes every known host and finds the real master.
        let factory = FakeFactory::with_roles(&[
            ("10.0.0.1:6379", ServerRole::Replica),
            ("10.0.0.2:6379", ServerRole::Master),
        ]);
        let source = Arc::new(FakeSource {
            master: Mutex::new(Endpoint::parse("10.0.0.1:6379").unwrap()),
            replicas: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            failovers: AtomicUsize::new(0),
            factory: factory.clone(),
            promote_on_failover: None,
        });

        let settings = SentinelSettings {
            stall_window: Duration::from_millis(5),
            failover_wait: Duration::from_millis(2),
            max_wait: Duration::from_millis(40),
        };
        let resolver = build(
            factory,
            source,
            &["10.0.0.1:6379"],
            &["10.0.0.2:6379"],
            settings,
        );

        let conn = resolver.create_master_connection(0).await.unwrap();
        assert_eq!(conn.endpoint().address(), "10.0.0.2:6379");
        assert_eq!(
            resolver.topology().masters,
            endpoints(&["10.0.0.2:6379"])
        );
    }

    #[tokio::test]
    async fn test_replica_resolution_prefers_source() {
        let factory = FakeFactory::with_roles(&[("10.0.1.5:6379", ServerRole::Replica)]);
        let source = Arc::new(FakeSource {
            master: Mutex::new(Endpoint::parse("10.0.0.1:6379").unwrap()),
            replicas: Mutex::new(endpoints(&["10.0.1.5:6379"])),
            unreachable: AtomicBool::new(false),
            failovers: AtomicUsize::new(0),
            factory: factory.clone(),
            promote_on_failover: None,
        });

        let resolver = build(
            factory,
            source,
            &["10.0.0.1:6379"],
            &["10.0.1.9:6379"],
            fast_sentinel_settings(),
        );

        let conn = resolver.create_replica_connection(0).await.unwrap();
        assert_eq!(conn.endpoint().address(), "10.0.1.5:6379");
        assert_eq!(
            resolver.topology().replicas,
            endpoints(&["10.0.1.5:6379"])
        );
    }
}
