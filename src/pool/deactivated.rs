/// Registry of deactivated-but-not-yet-disposed connections
///
/// A connection leaving the pool (exception history, failover, shutdown)
/// is not torn down under the caller's feet: it is parked here with a
/// timestamp and dropped once the expiry window has elapsed. A zero
/// window disposes immediately. Expiry is scanned lazily from every pool
/// acquisition rather than by a background task.
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::metrics::{Counter, MetricsSink};
use crate::pool::PooledConnection;

struct DeactivatedEntry {
    handle: Arc<PooledConnection>,
    since: Instant,
}

pub struct DeactivatedRegistry {
    expiry: Duration,
    entries: Mutex<Vec<DeactivatedEntry>>,
    metrics: Arc<dyn MetricsSink>,
}

impl DeactivatedRegistry {
    pub(crate) fn new(expiry: Duration, metrics: Arc<dyn MetricsSink>) -> Self {
        DeactivatedRegistry {
            expiry,
            entries: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Park a connection for delayed disposal. Idempotent per connection.
    pub(crate) fn deactivate(&self, handle: Arc<PooledConnection>) {
        if !handle.mark_deactivated() {
            return;
        }
        self.metrics.incr(Counter::Deactivations);

        if self.expiry.is_zero() {
            debug!("Disposing deactivated connection #{} immediately", handle.id());
            return;
        }

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push(DeactivatedEntry {
            handle,
            since: Instant::now(),
        });
    }

    /// Drop every entry older than the expiry window.
    pub(crate) fn dispose_expired(&self) {
        if self.expiry.is_zero() {
            return;
        }
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.since.elapsed() < self.expiry);
        let disposed = before - entries.len();
        if disposed > 0 {
            debug!("Disposed {} expired deactivated connection(s)", disposed);
        }
    }

    /// Drop everything regardless of age. Used on shutdown.
    pub(crate) fn dispose_all(&self) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !entries.is_empty() {
            debug!("Disposing all {} deactivated connection(s)", entries.len());
        }
        entries.clear();
    }

    /// Number of connections awaiting disposal.
    pub fn pending(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
