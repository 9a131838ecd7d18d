/// Distributed lock over optimistic concurrency control
///
/// The lock's state lives entirely in the backing store: a single key
/// whose string value encodes the lock's own expiry epoch. Acquisition
/// first tries a SET-if-absent; on contention it watches the key, judges
/// the stored expiry, and reclaims expired locks through a transactional
/// SET that only commits when the watched key was untouched. This is a
/// cooperative mutual-exclusion primitive with expiry-based liveness, not
/// a fencing-token protocol: a crashed holder is tolerated, a holder that
/// resumes after its lease expired is not.
///
/// `release` deletes the key unconditionally by default. The opt-in
/// fenced mode compares the stored value to the acquirer's own token
/// under a watch before deleting, so a lock reclaimed by someone else is
/// left alone.
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::core::connection::KvConnection;
use crate::error::{FaroError, FaroResult};
use crate::utils::{epoch_ms, jittered_backoff};

/// Lease written when the caller does not bound the acquisition.
const DEFAULT_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Lock acquisition behavior.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Verify ownership (stored value equals the acquirer's token) inside
    /// a watch+transaction before deleting on release.
    pub fenced: bool,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            fenced: false,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
        }
    }
}

/// A held distributed lock. Release it explicitly via [`release`](Self::release);
/// an abandoned lock is reclaimed by other acquirers once its lease expires.
#[derive(Debug)]
pub struct DistributedLock {
    key: String,
    value: String,
    fenced: bool,
}

impl DistributedLock {
    /// Acquire `key`, retrying with jittered exponential backoff until
    /// `timeout` elapses. `None` retries indefinitely.
    pub async fn acquire(
        conn: &mut dyn KvConnection,
        key: &str,
        timeout: Option<Duration>,
    ) -> FaroResult<Self> {
        Self::acquire_with(conn, key, timeout, LockOptions::default()).await
    }

    pub async fn acquire_with(
        conn: &mut dyn KvConnection,
        key: &str,
        timeout: Option<Duration>,
        options: LockOptions,
    ) -> FaroResult<Self> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let lease = timeout.unwrap_or(DEFAULT_LEASE);
        let mut attempt = 0u32;

        loop {
            // The stored value encodes the lock's own expiry.
            let lock_value = (epoch_ms() + lease.as_millis() + 1).to_string();

            if conn.set_if_not_exists(key, &lock_value).await? {
                debug!("Acquired lock '{}' until {}", key, lock_value);
                return Ok(DistributedLock {
                    key: key.to_string(),
                    value: lock_value,
                    fenced: options.fenced,
                });
            }

            conn.watch(key).await?;
            let stored = conn.get(key).await?;
            match stored.and_then(|v| v.parse::<u128>().ok()) {
                // Unparsable or vanished between SET and GET: treat as
                // contention, not corruption.
                None => conn.unwatch().await?,
                // Someone legitimately holds it.
                Some(expires) if expires > epoch_ms() => conn.unwatch().await?,
                // The previous holder crashed past its lease. Reclaim under
                // the watch; a failed commit means a concurrent reclaimer won.
                Some(_) => {
                    if conn.transactional_set(key, &lock_value).await? {
                        debug!("Reclaimed expired lock '{}'", key);
                        return Ok(DistributedLock {
                            key: key.to_string(),
                            value: lock_value,
                            fenced: options.fenced,
                        });
                    }
                }
            }

            let delay = jittered_backoff(attempt, options.backoff_base, options.backoff_cap);
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FaroError::LockTimeout {
                            key: key.to_string(),
                            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                        });
                    }
                    sleep(delay.min(deadline - now)).await;
                }
                None => sleep(delay).await,
            }
            attempt += 1;
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value this acquirer wrote; doubles as the fencing token.
    pub fn token(&self) -> &str {
        &self.value
    }

    /// Release the lock.
    ///
    /// Default mode deletes the key unconditionally, even when the lease
    /// already expired and another holder reclaimed it. Fenced mode only
    /// deletes when the stored value is still this acquirer's token.
    pub async fn release(self, conn: &mut dyn KvConnection) -> FaroResult<()> {
        if !self.fenced {
            conn.del(&self.key).await?;
            return Ok(());
        }

        conn.watch(&self.key).await?;
        match conn.get(&self.key).await? {
            Some(current) if current == self.value => {
                // Commit failure means ownership changed mid-release; the
                // new holder's lock is left intact either way.
                conn.transactional_del(&self.key).await?;
                Ok(())
            }
            _ => {
                debug!("Lock '{}' no longer owned; skipping delete", self.key);
                conn.unwatch().await?;
                Ok(())
            }
        }
    }
}
