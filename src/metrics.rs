/// Driver metrics: injectable counter sink and the default aggregate
///
/// Every counter is monotonic and incremented at the moment the
/// corresponding event occurs. Counters reset only through an explicit
/// administrative `reset()`. Components receive an `Arc<dyn MetricsSink>`
/// so multiple managers in one process never share counters by accident;
/// pass one `DriverMetrics` instance to several managers when aggregate
/// numbers are wanted.
use std::sync::atomic::{AtomicU64, Ordering};

/// Countable driver events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Topology failovers applied via `failover_to`
    Failovers,
    /// Failovers forcibly requested from a sentinel
    ForcedFailovers,
    /// Connections created by a manager
    ClientsCreated,
    /// Connections handed to callers without being tracked by a pool
    ClientsCreatedOutsidePool,
    /// Hosts that claimed to be masters but self-reported another role
    InvalidMasters,
    /// Retries performed by verification and lock backoff loops
    Retries,
    /// Connections moved to the deactivated registry
    Deactivations,
}

/// Sink for driver counter events.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter);
}

/// Sink that discards every event.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: Counter) {}
}

/// Point-in-time snapshot of all driver counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub failovers: u64,
    pub forced_failovers: u64,
    pub clients_created: u64,
    pub clients_created_outside_pool: u64,
    pub invalid_masters: u64,
    pub retries: u64,
    pub deactivations: u64,
}

/// Default atomic aggregate implementation of [`MetricsSink`].
#[derive(Debug, Default)]
pub struct DriverMetrics {
    failovers: AtomicU64,
    forced_failovers: AtomicU64,
    clients_created: AtomicU64,
    clients_created_outside_pool: AtomicU64,
    invalid_masters: AtomicU64,
    retries: AtomicU64,
    deactivations: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Failovers => &self.failovers,
            Counter::ForcedFailovers => &self.forced_failovers,
            Counter::ClientsCreated => &self.clients_created,
            Counter::ClientsCreatedOutsidePool => &self.clients_created_outside_pool,
            Counter::InvalidMasters => &self.invalid_masters,
            Counter::Retries => &self.retries,
            Counter::Deactivations => &self.deactivations,
        }
    }

    /// Current value of a single counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    /// Snapshot all counters at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            failovers: self.get(Counter::Failovers),
            forced_failovers: self.get(Counter::ForcedFailovers),
            clients_created: self.get(Counter::ClientsCreated),
            clients_created_outside_pool: self.get(Counter::ClientsCreatedOutsidePool),
            invalid_masters: self.get(Counter::InvalidMasters),
            retries: self.get(Counter::Retries),
            deactivations: self.get(Counter::Deactivations),
        }
    }

    /// Administrative reset of every counter back to zero.
    pub fn reset(&self) {
        for counter in [
            Counter::Failovers,
            Counter::ForcedFailovers,
            Counter::ClientsCreated,
            Counter::ClientsCreatedOutsidePool,
            Counter::InvalidMasters,
            Counter::Retries,
            Counter::Deactivations,
        ] {
            self.cell(counter).store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSink for DriverMetrics {
    fn incr(&self, counter: Counter) {
        self.cell(counter).fetch_add(1, Ordering::Relaxed);
    }
}
