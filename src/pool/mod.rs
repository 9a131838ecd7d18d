/// Pooled connection management
///
/// The manager owns two fixed-size slot arrays (read/write and read-only)
/// and hands out exclusively-owned connections. Acquisition scans for a
/// reusable idle connection under the pool lock, claims an empty slot with
/// a reservation token when none is reusable, performs connection creation
/// strictly outside the lock, and installs the result only if the slot was
/// untouched in the meantime. A concurrent failover that replaced the slot
/// turns the freshly created connection into an untracked one rather than
/// corrupting the pool.
///
/// The pool lock protects in-memory slot transitions only; it is never
/// held across network I/O. Waiting happens either against the configured
/// pool timeout or, when none is set, on a fixed recheck interval forever
/// (see `PoolSettings::recheck_interval`).
pub mod deactivated;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info};

use crate::core::connection::KvConnection;
use crate::core::{ConnectionSettings, Endpoint, ServerRole};
use crate::error::{FaroError, FaroResult};
use crate::manager::{ClientManager, FailoverEvent, FailoverListener};
use crate::metrics::{Counter, DriverMetrics, MetricsSink, MetricsSnapshot};
use crate::pool::deactivated::DeactivatedRegistry;
use crate::resolver::HostResolver;

/// Pool behavior settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_write_pool_size: usize,
    pub max_read_pool_size: usize,
    /// Maximum time to wait for a free slot. `None` waits forever,
    /// re-scanning every `recheck_interval`.
    pub pool_timeout: Option<Duration>,
    /// Re-scan cadence for the wait-forever mode. Release signals still
    /// shorten the wait; the interval doubles as a recovery path for
    /// missed signals.
    pub recheck_interval: Duration,
    /// How long deactivated connections linger before disposal. Zero
    /// disposes immediately.
    pub deactivated_expiry: Duration,
    /// Allocate the slot arrays at construction time.
    pub auto_start: bool,
    /// Connection settings re-applied on every acquisition.
    pub connection: ConnectionSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_write_pool_size: 20,
            max_read_pool_size: 20,
            pool_timeout: Some(Duration::from_secs(2)),
            recheck_interval: Duration::from_millis(100),
            deactivated_expiry: Duration::from_secs(10),
            auto_start: true,
            connection: ConnectionSettings::default(),
        }
    }
}

/// A connection tracked by a pool slot, carrying its lifecycle flags.
pub struct PooledConnection {
    id: u64,
    endpoint: Endpoint,
    conn: Arc<tokio::sync::Mutex<Box<dyn KvConnection>>>,
    active: AtomicBool,
    had_exceptions: AtomicBool,
    deactivated_at: Mutex<Option<Instant>>,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, conn: Box<dyn KvConnection>) -> Self {
        let endpoint = conn.endpoint().clone();
        PooledConnection {
            id,
            endpoint,
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
            active: AtomicBool::new(true),
            had_exceptions: AtomicBool::new(false),
            deactivated_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn had_exceptions(&self) -> bool {
        self.had_exceptions.load(Ordering::SeqCst)
    }

    fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    fn set_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_exception(&self) {
        self.had_exceptions.store(true, Ordering::SeqCst);
    }

    /// Record the deactivation timestamp. Returns false when already set.
    pub(crate) fn mark_deactivated(&self) -> bool {
        let mut at = self
            .deactivated_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if at.is_some() {
            return false;
        }
        *at = Some(Instant::now());
        true
    }

    fn lock_owned(&self) -> FaroResult<OwnedMutexGuard<Box<dyn KvConnection>>> {
        self.conn
            .clone()
            .try_lock_owned()
            .map_err(|_| FaroError::internal("pooled connection is still held by another caller"))
    }

    /// Best-effort connectivity hint for stats. A connection currently in
    /// use counts as connected.
    fn is_connected_hint(&self) -> bool {
        match self.conn.try_lock() {
            Ok(conn) => conn.is_connected(),
            Err(_) => true,
        }
    }
}

/// One fixed array position tracking one reusable connection's lifecycle.
#[derive(Clone)]
enum Slot {
    Empty,
    /// Claimed for in-flight connection creation; the token identifies the
    /// claiming acquisition.
    Reserved(u64),
    Occupied(Arc<PooledConnection>),
}

/// What the claiming acquisition observed in its slot, used to detect a
/// concurrent replacement before installing the new connection.
#[derive(Clone)]
enum Observed {
    Reserved(u64),
    Occupied(Arc<PooledConnection>),
}

#[derive(Clone)]
struct Claim {
    index: usize,
    observed: Observed,
}

enum Scan {
    Reuse(Arc<PooledConnection>),
    Claim(Claim),
    Saturated,
}

struct PoolState {
    slots: Vec<Slot>,
    index: u64,
}

struct Pool {
    state: Mutex<PoolState>,
    notify: tokio::sync::Notify,
}

impl Pool {
    fn new() -> Self {
        Pool {
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                index: 0,
            }),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Write,
    Read,
}

impl PoolKind {
    fn name(&self) -> &'static str {
        match self {
            PoolKind::Write => "read-write",
            PoolKind::Read => "read-only",
        }
    }
}

struct Inner {
    resolver: Arc<dyn HostResolver>,
    write: Pool,
    read: Pool,
    settings: PoolSettings,
    metrics: Arc<DriverMetrics>,
    deactivated: DeactivatedRegistry,
    listeners: Mutex<Vec<FailoverListener>>,
    client_counter: AtomicU64,
    reservation_counter: AtomicU64,
    blocking_rt: OnceLock<tokio::runtime::Runtime>,
}

impl Inner {
    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Write => &self.write,
            PoolKind::Read => &self.read,
        }
    }

    fn host_count(&self, kind: PoolKind) -> usize {
        let count = match kind {
            PoolKind::Write => self.resolver.read_write_host_count(),
            PoolKind::Read => self.resolver.read_only_host_count(),
        };
        count.max(1)
    }

    /// Scan one pool for a reusable or claimable slot. Runs entirely under
    /// the pool lock; performs no I/O.
    ///
    /// The scan strides the slot array by host count starting from the
    /// round-robin desired index, so slots map onto hosts and successive
    /// acquisitions cycle through hosts in index order.
    fn scan(&self, kind: PoolKind, host_count: usize) -> FaroResult<Scan> {
        let pool = self.pool(kind);
        let mut state = pool.lock();
        if state.slots.is_empty() {
            return Err(FaroError::config(format!(
                "{} pool has not been started; configure a pool size of at least 1 and call start()",
                kind.name()
            )));
        }

        let len = state.slots.len();
        let desired = (state.index as usize) % len;

        for x in 0..host_count {
            let start = (desired + x) % host_count;
            let mut i = start;
            while i < len {
                match &state.slots[i] {
                    Slot::Occupied(conn) if !conn.is_active() && !conn.had_exceptions() => {
                        let handle = conn.clone();
                        handle.activate();
                        state.index += 1;
                        return Ok(Scan::Reuse(handle));
                    }
                    Slot::Empty => {
                        let token = self.reservation_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        state.slots[i] = Slot::Reserved(token);
                        return Ok(Scan::Claim(Claim {
                            index: i,
                            observed: Observed::Reserved(token),
                        }));
                    }
                    Slot::Occupied(conn) if conn.had_exceptions() => {
                        return Ok(Scan::Claim(Claim {
                            index: i,
                            observed: Observed::Occupied(conn.clone()),
                        }));
                    }
                    _ => {}
                }
                i += host_count;
            }
        }

        Ok(Scan::Saturated)
    }

    fn release(&self, kind: PoolKind, handle: Arc<PooledConnection>) {
        let pool = self.pool(kind);
        let deactivate = handle.had_exceptions();
        {
            let mut state = pool.lock();
            if deactivate {
                let position = state.slots.iter().position(
                    |slot| matches!(slot, Slot::Occupied(c) if Arc::ptr_eq(c, &handle)),
                );
                if let Some(i) = position {
                    state.slots[i] = Slot::Empty;
                }
            }
            handle.set_inactive();
        }
        if deactivate {
            debug!(
                "Connection #{} released with exception history; deactivating",
                handle.id()
            );
            self.deactivated.deactivate(handle);
        }
        pool.notify.notify_one();
    }

    fn new_handle(&self, mut conn: Box<dyn KvConnection>) -> Arc<PooledConnection> {
        conn.apply_settings(&self.settings.connection);
        let id = self.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.incr(Counter::ClientsCreated);
        Arc::new(PooledConnection::new(id, conn))
    }

    fn notify_failover(&self, event: &FailoverEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (i, listener) in listeners.iter().enumerate() {
            if let Err(e) = listener(event) {
                error!("Failover listener {} failed: {}", i, e);
            }
        }
    }
}

/// Reverts an in-flight slot claim when connection creation fails or the
/// acquiring task is cancelled, so a `Reserved` slot can never be
/// stranded.
struct RollbackGuard {
    inner: Arc<Inner>,
    kind: PoolKind,
    claim: Claim,
    armed: bool,
}

impl RollbackGuard {
    fn new(inner: Arc<Inner>, kind: PoolKind, claim: Claim) -> Self {
        RollbackGuard {
            inner,
            kind,
            claim,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = self.inner.pool(self.kind);
        {
            let mut state = pool.lock();
            if self.claim.index < state.slots.len() {
                let ours = match (&state.slots[self.claim.index], &self.claim.observed) {
                    (Slot::Reserved(t), Observed::Reserved(token)) => t == token,
                    (Slot::Occupied(c), Observed::Occupied(o)) => Arc::ptr_eq(c, o),
                    _ => false,
                };
                if ours {
                    state.slots[self.claim.index] = Slot::Empty;
                }
            }
        }
        pool.notify.notify_one();
    }
}

/// Per-pool slot statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub empty_slots: usize,
    pub reserved_slots: usize,
    pub in_use: usize,
    pub idle: usize,
    pub with_exceptions: usize,
    pub connected: usize,
}

/// Snapshot of both pools plus driver counters.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub write: PoolStats,
    pub read: PoolStats,
    pub pending_deactivated: usize,
    pub counters: MetricsSnapshot,
}

/// Thread-safe pooling manager over a resolver.
///
/// Cloning is cheap and shares the same pools.
#[derive(Clone)]
pub struct PooledClientManager {
    inner: Arc<Inner>,
}

impl PooledClientManager {
    pub fn new(resolver: Arc<dyn HostResolver>, settings: PoolSettings) -> FaroResult<Self> {
        Self::with_metrics(resolver, settings, Arc::new(DriverMetrics::new()))
    }

    /// Build with an injected metrics aggregate, shared across managers
    /// when combined counters are wanted.
    pub fn with_metrics(
        resolver: Arc<dyn HostResolver>,
        settings: PoolSettings,
        metrics: Arc<DriverMetrics>,
    ) -> FaroResult<Self> {
        let auto_start = settings.auto_start;
        let deactivated = DeactivatedRegistry::new(settings.deactivated_expiry, metrics.clone());
        let inner = Arc::new(Inner {
            resolver,
            write: Pool::new(),
            read: Pool::new(),
            settings,
            metrics,
            deactivated,
            listeners: Mutex::new(Vec::new()),
            client_counter: AtomicU64::new(0),
            reservation_counter: AtomicU64::new(0),
            blocking_rt: OnceLock::new(),
        });
        let manager = PooledClientManager { inner };
        if auto_start {
            manager.start()?;
        }
        Ok(manager)
    }

    /// Allocate the fixed slot arrays. Fails when already started.
    pub fn start(&self) -> FaroResult<()> {
        for (kind, size) in [
            (PoolKind::Write, self.inner.settings.max_write_pool_size),
            (PoolKind::Read, self.inner.settings.max_read_pool_size),
        ] {
            let pool = self.inner.pool(kind);
            let mut state = pool.lock();
            if !state.slots.is_empty() {
                return Err(FaroError::config("pool has already been started"));
            }
            state.slots = vec![Slot::Empty; size];
            state.index = 0;
        }
        Ok(())
    }

    /// Acquire a read/write connection bound to a master endpoint.
    pub async fn get_client(&self) -> FaroResult<ClientGuard> {
        self.acquire(PoolKind::Write).await
    }

    /// Acquire a read-only connection bound to a replica endpoint (or a
    /// master when no replicas are configured).
    pub async fn get_read_only_client(&self) -> FaroResult<ClientGuard> {
        self.acquire(PoolKind::Read).await
    }

    /// Blocking variant of [`get_client`](Self::get_client), driving the
    /// identical acquisition algorithm on a manager-owned runtime. Must
    /// not be called from inside an async runtime.
    pub fn get_client_blocking(&self) -> FaroResult<ClientGuard> {
        self.drive(self.get_client())
    }

    /// Blocking variant of [`get_read_only_client`](Self::get_read_only_client).
    pub fn get_read_only_client_blocking(&self) -> FaroResult<ClientGuard> {
        self.drive(self.get_read_only_client())
    }

    fn drive<F>(&self, future: F) -> FaroResult<ClientGuard>
    where
        F: std::future::Future<Output = FaroResult<ClientGuard>>,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(FaroError::config(
                "blocking acquisition cannot run inside an async runtime; use the async API",
            ));
        }
        let runtime = self.blocking_runtime()?;
        runtime.block_on(future)
    }

    fn blocking_runtime(&self) -> FaroResult<&tokio::runtime::Runtime> {
        if let Some(runtime) = self.inner.blocking_rt.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(FaroError::Io)?;
        Ok(self.inner.blocking_rt.get_or_init(move || runtime))
    }

    async fn acquire(&self, kind: PoolKind) -> FaroResult<ClientGuard> {
        let result = self.acquire_inner(kind).await;
        // Opportunistic cleanup regardless of outcome.
        self.inner.deactivated.dispose_expired();
        result
    }

    async fn acquire_inner(&self, kind: PoolKind) -> FaroResult<ClientGuard> {
        let inner = &self.inner;
        let pool = inner.pool(kind);
        let started = Instant::now();

        let claim = loop {
            let host_count = inner.host_count(kind);
            match inner.scan(kind, host_count)? {
                Scan::Reuse(handle) => {
                    let mut conn = match handle.lock_owned() {
                        Ok(conn) => conn,
                        Err(e) => {
                            handle.set_inactive();
                            return Err(e);
                        }
                    };
                    conn.apply_settings(&inner.settings.connection);
                    return Ok(ClientGuard::pooled(conn, handle, inner.clone(), kind));
                }
                Scan::Claim(claim) => break claim,
                Scan::Saturated => match inner.settings.pool_timeout {
                    Some(limit) => {
                        let elapsed = started.elapsed();
                        if elapsed >= limit {
                            return Err(FaroError::PoolTimeout {
                                waited_ms: elapsed.as_millis() as u64,
                            });
                        }
                        let wait = limit - elapsed;
                        if tokio::time::timeout(wait, pool.notify.notified())
                            .await
                            .is_err()
                        {
                            return Err(FaroError::PoolTimeout {
                                waited_ms: started.elapsed().as_millis() as u64,
                            });
                        }
                    }
                    None => {
                        // Wait-forever mode: recheck on a fixed interval even
                        // without a release signal.
                        let _ = tokio::time::timeout(
                            inner.settings.recheck_interval,
                            pool.notify.notified(),
                        )
                        .await;
                    }
                },
            }
        };

        // A slot holding a connection with exception history is replaced;
        // the old connection moves to the deactivated registry first.
        if let Observed::Occupied(old) = &claim.observed {
            inner.deactivated.deactivate(old.clone());
        }

        // Connection creation (the only step doing I/O) runs outside the
        // pool lock, under a rollback guard covering errors and
        // cancellation alike.
        let rollback = RollbackGuard::new(inner.clone(), kind, claim.clone());
        let created = match kind {
            PoolKind::Write => inner.resolver.create_master_connection(claim.index).await,
            PoolKind::Read => inner.resolver.create_replica_connection(claim.index).await,
        };
        let conn = match created {
            Ok(conn) => conn,
            Err(e) => {
                drop(rollback);
                return Err(e);
            }
        };

        let handle = inner.new_handle(conn);

        let mut state = pool.lock();
        // The slot may have been cleared (failover) or the whole pool torn
        // down (shutdown) while creation was in flight.
        let unchanged = match (state.slots.get(claim.index), &claim.observed) {
            (Some(Slot::Reserved(current)), Observed::Reserved(token)) => current == token,
            (Some(Slot::Occupied(current)), Observed::Occupied(observed)) => {
                Arc::ptr_eq(current, observed)
            }
            _ => false,
        };

        if !unchanged {
            // A concurrent failover replaced the slot. The caller still
            // gets a usable connection, just not a pool-tracked one.
            drop(state);
            rollback.disarm();
            debug!(
                "Slot {} changed during connection creation; returning client outside the {} pool",
                claim.index,
                kind.name()
            );
            inner.metrics.incr(Counter::ClientsCreatedOutsidePool);
            let conn = handle.lock_owned()?;
            return Ok(ClientGuard::unpooled_handle(conn, handle));
        }

        state.index += 1;
        state.slots[claim.index] = Slot::Occupied(handle.clone());
        drop(state);
        rollback.disarm();

        let conn = handle.lock_owned()?;
        Ok(ClientGuard::pooled(conn, handle, inner.clone(), kind))
    }

    /// Administrative topology switch: swaps the resolver's lists in one
    /// critical section, deactivates every pooled connection, resets the
    /// round-robin indices, and invokes failover listeners synchronously
    /// in registration order.
    pub fn failover_to(
        &self,
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
    ) -> FaroResult<()> {
        let inner = &self.inner;
        inner.metrics.incr(Counter::Failovers);
        info!(
            "FailoverTo: masters=[{}] replicas=[{}] total={}",
            masters
                .iter()
                .map(Endpoint::address)
                .collect::<Vec<_>>()
                .join(","),
            replicas
                .iter()
                .map(Endpoint::address)
                .collect::<Vec<_>>()
                .join(","),
            inner.metrics.get(Counter::Failovers)
        );

        inner
            .resolver
            .reset_topology(masters.clone(), replicas.clone())?;

        for kind in [PoolKind::Read, PoolKind::Write] {
            let pool = inner.pool(kind);
            {
                let mut state = pool.lock();
                for slot in state.slots.iter_mut() {
                    if let Slot::Occupied(conn) = slot {
                        inner.deactivated.deactivate(conn.clone());
                    }
                    *slot = Slot::Empty;
                }
                state.index = 0;
            }
            pool.notify.notify_waiters();
            pool.notify.notify_one();
        }

        let event = FailoverEvent {
            masters,
            replicas,
            total_failovers: inner.metrics.get(Counter::Failovers),
        };
        inner.notify_failover(&event);
        Ok(())
    }

    /// Register a failover listener, invoked synchronously after every
    /// topology swap. One listener's failure never blocks the others.
    pub fn on_failover(&self, listener: FailoverListener) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Snapshot slot statistics and driver counters.
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            write: self.pool_stats(PoolKind::Write),
            read: self.pool_stats(PoolKind::Read),
            pending_deactivated: self.inner.deactivated.pending(),
            counters: self.inner.metrics.snapshot(),
        }
    }

    fn pool_stats(&self, kind: PoolKind) -> PoolStats {
        let pool = self.inner.pool(kind);
        let state = pool.lock();
        let mut stats = PoolStats {
            pool_size: state.slots.len(),
            ..Default::default()
        };
        for slot in &state.slots {
            match slot {
                Slot::Empty => stats.empty_slots += 1,
                Slot::Reserved(_) => stats.reserved_slots += 1,
                Slot::Occupied(conn) => {
                    if conn.is_active() {
                        stats.in_use += 1;
                    } else {
                        stats.idle += 1;
                    }
                    if conn.had_exceptions() {
                        stats.with_exceptions += 1;
                    }
                    if conn.is_connected_hint() {
                        stats.connected += 1;
                    }
                }
            }
        }
        stats
    }

    /// Per-slot activity states of the read/write pool:
    /// `-1` empty, `0` idle or reserved, `1` active.
    pub fn pool_active_states(&self) -> Vec<i8> {
        self.active_states(PoolKind::Write)
    }

    /// Per-slot activity states of the read-only pool.
    pub fn read_only_pool_active_states(&self) -> Vec<i8> {
        self.active_states(PoolKind::Read)
    }

    fn active_states(&self, kind: PoolKind) -> Vec<i8> {
        let pool = self.inner.pool(kind);
        let state = pool.lock();
        state
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Empty => -1,
                Slot::Reserved(_) => 0,
                Slot::Occupied(conn) => i8::from(conn.is_active()),
            })
            .collect()
    }

    /// Current driver counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Connections awaiting delayed disposal.
    pub fn pending_deactivated(&self) -> usize {
        self.inner.deactivated.pending()
    }

    /// Drop every pooled connection and flush the deactivated registry.
    /// Outstanding client guards stay usable; their connections are simply
    /// no longer pool-tracked.
    pub fn shutdown(&self) {
        for kind in [PoolKind::Write, PoolKind::Read] {
            let pool = self.inner.pool(kind);
            let mut state = pool.lock();
            state.slots.clear();
            state.index = 0;
        }
        self.inner.deactivated.dispose_all();
    }
}

#[async_trait]
impl ClientManager for PooledClientManager {
    async fn get_client(&self) -> FaroResult<ClientGuard> {
        PooledClientManager::get_client(self).await
    }

    async fn get_read_only_client(&self) -> FaroResult<ClientGuard> {
        PooledClientManager::get_read_only_client(self).await
    }

    fn failover_to(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> FaroResult<()> {
        PooledClientManager::failover_to(self, masters, replicas)
    }

    fn on_failover(&self, listener: FailoverListener) {
        PooledClientManager::on_failover(self, listener)
    }
}

/// Exclusively-owned connection handed out by a manager.
///
/// Dropping the guard returns a healthy pooled connection to its slot and
/// wakes one waiter; a connection that recorded transport errors is
/// deactivated instead. Untracked guards (basic manager, failover races)
/// simply close their connection on drop.
pub struct ClientGuard {
    conn: Option<OwnedMutexGuard<Box<dyn KvConnection>>>,
    handle: Arc<PooledConnection>,
    release_to: Option<(Arc<Inner>, PoolKind)>,
}

impl ClientGuard {
    fn pooled(
        conn: OwnedMutexGuard<Box<dyn KvConnection>>,
        handle: Arc<PooledConnection>,
        inner: Arc<Inner>,
        kind: PoolKind,
    ) -> Self {
        ClientGuard {
            conn: Some(conn),
            handle,
            release_to: Some((inner, kind)),
        }
    }

    fn unpooled_handle(
        conn: OwnedMutexGuard<Box<dyn KvConnection>>,
        handle: Arc<PooledConnection>,
    ) -> Self {
        ClientGuard {
            conn: Some(conn),
            handle,
            release_to: None,
        }
    }

    /// Build a guard around a freshly created, untracked connection.
    pub(crate) fn unpooled(handle: Arc<PooledConnection>) -> FaroResult<Self> {
        let conn = handle.lock_owned()?;
        Ok(ClientGuard::unpooled_handle(conn, handle))
    }

    /// Manager-assigned connection id.
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Whether this connection returns to a pool on drop.
    pub fn is_pooled(&self) -> bool {
        self.release_to.is_some()
    }

    /// Record an error against this connection so the pool deactivates it
    /// on release instead of reusing it.
    pub fn mark_failed(&self) {
        self.handle.mark_exception();
    }

    fn conn_mut(&mut self) -> FaroResult<&mut Box<dyn KvConnection>> {
        self.conn
            .as_mut()
            .map(|guard| &mut **guard)
            .ok_or_else(|| FaroError::internal("connection guard already released"))
    }

    /// Transport-level failures poison the connection for the release
    /// policy; command-level errors do not.
    fn note<T>(&self, result: &FaroResult<T>) {
        if matches!(
            result,
            Err(FaroError::Io(_)) | Err(FaroError::Connection { .. })
        ) {
            self.handle.mark_exception();
        }
    }
}

#[async_trait]
impl KvConnection for ClientGuard {
    fn endpoint(&self) -> &Endpoint {
        self.handle.endpoint()
    }

    fn is_connected(&self) -> bool {
        self.conn
            .as_ref()
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    fn apply_settings(&mut self, settings: &ConnectionSettings) {
        if let Some(conn) = self.conn.as_mut() {
            conn.apply_settings(settings);
        }
    }

    async fn role(&mut self) -> FaroResult<ServerRole> {
        let result = self.conn_mut()?.role().await;
        self.note(&result);
        result
    }

    async fn ping(&mut self) -> FaroResult<bool> {
        let result = self.conn_mut()?.ping().await;
        self.note(&result);
        result
    }

    async fn get(&mut self, key: &str) -> FaroResult<Option<String>> {
        let result = self.conn_mut()?.get(key).await;
        self.note(&result);
        result
    }

    async fn set_if_not_exists(&mut self, key: &str, value: &str) -> FaroResult<bool> {
        let result = self.conn_mut()?.set_if_not_exists(key, value).await;
        self.note(&result);
        result
    }

    async fn del(&mut self, key: &str) -> FaroResult<bool> {
        let result = self.conn_mut()?.del(key).await;
        self.note(&result);
        result
    }

    async fn watch(&mut self, key: &str) -> FaroResult<()> {
        let result = self.conn_mut()?.watch(key).await;
        self.note(&result);
        result
    }

    async fn unwatch(&mut self) -> FaroResult<()> {
        let result = self.conn_mut()?.unwatch().await;
        self.note(&result);
        result
    }

    async fn transactional_set(&mut self, key: &str, value: &str) -> FaroResult<bool> {
        let result = self.conn_mut()?.transactional_set(key, value).await;
        self.note(&result);
        result
    }

    async fn transactional_del(&mut self, key: &str) -> FaroResult<bool> {
        let result = self.conn_mut()?.transactional_del(key).await;
        self.note(&result);
        result
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        // Free the inner mutex before the slot is marked reusable.
        drop(self.conn.take());
        if let Some((inner, kind)) = self.release_to.take() {
            inner.release(kind, self.handle.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnectionFactory;
    use crate::resolver::tests::FakeConn;
    use crate::resolver::Topology;
    use std::sync::atomic::AtomicUsize;

    /// Counting factory with injectable failures and an optional gate that
    /// holds connection creation until released.
    #[derive(Default)]
    struct PoolFactory {
        connects: AtomicUsize,
        fail_times: AtomicUsize,
        hold: AtomicBool,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl ConnectionFactory for PoolFactory {
        async fn connect(&self, endpoint: &Endpoint) -> FaroResult<Box<dyn KvConnection>> {
            if self.hold.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let failures = self.fail_times.load(Ordering::SeqCst);
            if failures > 0 {
                self.fail_times.store(failures - 1, Ordering::SeqCst);
                return Err(FaroError::connection(
                    endpoint.address(),
                    "injected failure".to_string(),
                ));
            }
            Ok(Box::new(FakeConn {
                endpoint: endpoint.clone(),
                role: ServerRole::Master,
            }))
        }
    }

    /// Resolver stub creating connections straight from the factory,
    /// without verification.
    struct StubResolver {
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        factory: Arc<PoolFactory>,
    }

    impl StubResolver {
        fn new(factory: Arc<PoolFactory>, masters: &[&str], replicas: &[&str]) -> Arc<Self> {
            Arc::new(StubResolver {
                masters: Endpoint::parse_many(masters).unwrap(),
                replicas: Endpoint::parse_many(replicas).unwrap(),
                factory,
            })
        }
    }

    #[async_trait]
    impl HostResolver for StubResolver {
        fn topology(&self) -> Arc<Topology> {
            Arc::new(Topology {
                masters: self.masters.clone(),
                replicas: self.replicas.clone(),
            })
        }

        fn read_write_host(&self, index: usize) -> Endpoint {
            self.masters[index % self.masters.len()].clone()
        }

        fn read_only_host(&self, index: usize) -> Endpoint {
            if self.replicas.is_empty() {
                self.read_write_host(index)
            } else {
                self.replicas[index % self.replicas.len()].clone()
            }
        }

        fn read_write_host_count(&self) -> usize {
            self.masters.len()
        }

        fn read_only_host_count(&self) -> usize {
            if self.replicas.is_empty() {
                self.masters.len()
            } else {
                self.replicas.len()
            }
        }

        fn reset_masters(&self, _masters: Vec<Endpoint>) -> FaroResult<()> {
            Ok(())
        }

        fn reset_replicas(&self, _replicas: Vec<Endpoint>) {}

        fn reset_topology(
            &self,
            _masters: Vec<Endpoint>,
            _replicas: Vec<Endpoint>,
        ) -> FaroResult<()> {
            Ok(())
        }

        async fn create_master_connection(
            &self,
            index: usize,
        ) -> FaroResult<Box<dyn KvConnection>> {
            self.factory.connect(&self.read_write_host(index)).await
        }

        async fn create_replica_connection(
            &self,
            index: usize,
        ) -> FaroResult<Box<dyn KvConnection>> {
            self.factory.connect(&self.read_only_host(index)).await
        }
    }

    /// Opt-in log output for debugging pool races:
    /// `RUST_LOG=faro=debug cargo test -- --nocapture`
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn manager_with(
        factory: Arc<PoolFactory>,
        masters: &[&str],
        pool_size: usize,
        pool_timeout: Option<Duration>,
    ) -> PooledClientManager {
        init_tracing();
        let resolver = StubResolver::new(factory, masters, &[]);
        let settings = PoolSettings {
            max_write_pool_size: pool_size,
            max_read_pool_size: pool_size,
            pool_timeout,
            recheck_interval: Duration::from_millis(10),
            deactivated_expiry: Duration::ZERO,
            ..Default::default()
        };
        PooledClientManager::new(resolver, settings).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_before_start_is_config_error() {
        let factory = Arc::new(PoolFactory::default());
        let resolver = StubResolver::new(factory, &["10.0.0.1:6379"], &[]);
        let settings = PoolSettings {
            auto_start: false,
            ..Default::default()
        };
        let manager = PooledClientManager::new(resolver, settings).unwrap();

        let result = manager.get_client().await;
        assert!(matches!(result, Err(FaroError::Config(_))));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 1, None);
        assert!(manager.start().is_err());
    }

    #[tokio::test]
    async fn test_round_trip_reuses_connections() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory.clone(), &["10.0.0.1:6379"], 2, None);

        let first = manager.get_client().await.unwrap();
        let first_id = first.id();
        drop(first);

        let second = manager.get_client().await.unwrap();
        // Same instance reactivated, not a new connection.
        assert_eq!(second.id(), first_id);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_holders_get_distinct_connections() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379", "10.0.0.2:6379"], 2, None);

        let a = manager.get_client().await.unwrap();
        let b = manager.get_client().await.unwrap();
        assert_ne!(a.id(), b.id());
        // Round-robin over hosts in index order.
        assert_ne!(a.endpoint().address(), b.endpoint().address());
    }

    #[tokio::test]
    async fn test_pool_timeout_when_saturated() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(
            factory,
            &["10.0.0.1:6379"],
            1,
            Some(Duration::from_millis(50)),
        );

        let _held = manager.get_client().await.unwrap();
        let started = Instant::now();
        let result = manager.get_client().await;
        assert!(matches!(result, Err(FaroError::PoolTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_forever_recovers_on_release() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 1, None);

        let held = manager.get_client().await.unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_client().await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.id(), 1);
    }

    #[tokio::test]
    async fn test_slot_rollback_after_factory_failure() {
        let factory = Arc::new(PoolFactory::default());
        factory.fail_times.store(1, Ordering::SeqCst);
        let manager = manager_with(factory.clone(), &["10.0.0.1:6379"], 1, None);

        let result = manager.get_client().await;
        assert!(matches!(result, Err(FaroError::Connection { .. })));

        // The slot reverted to empty; the pool is not degraded.
        let guard = manager.get_client().await.unwrap();
        assert!(guard.is_pooled());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reservation_not_reusable_by_second_acquirer() {
        let factory = Arc::new(PoolFactory::default());
        factory.hold.store(true, Ordering::SeqCst);
        let manager = manager_with(factory.clone(), &["10.0.0.1:6379"], 1, None);

        let acquire_and_release = |manager: PooledClientManager| {
            tokio::spawn(async move {
                let guard = manager.get_client().await.unwrap();
                let id = guard.id();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(guard);
                id
            })
        };
        let first = acquire_and_release(manager.clone());
        let second = acquire_and_release(manager.clone());

        // Both tasks are in flight; exactly one owns the reservation, the
        // other perceives the slot as unavailable and waits.
        tokio::time::sleep(Duration::from_millis(30)).await;
        factory.hold.store(false, Ordering::SeqCst);
        factory.gate.notify_waiters();

        let (a_id, b_id) = (first.await.unwrap(), second.await.unwrap());

        // The waiter reused the single pooled connection; the factory ran
        // exactly once.
        assert_eq!(a_id, b_id);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exclusivity_under_concurrency() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 3, None);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let manager = manager.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let guard = manager.get_client().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_failed_connection_deactivated_on_release() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory.clone(), &["10.0.0.1:6379"], 1, None);

        let guard = manager.get_client().await.unwrap();
        guard.mark_failed();
        drop(guard);

        // Zero expiry disposes immediately; counter still records it.
        assert_eq!(manager.metrics().deactivations, 1);
        assert_eq!(manager.pending_deactivated(), 0);

        // The slot is free again and a fresh connection is created.
        let replacement = manager.get_client().await.unwrap();
        assert_eq!(replacement.id(), 2);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failover_during_creation_returns_unpooled_client() {
        let factory = Arc::new(PoolFactory::default());
        factory.hold.store(true, Ordering::SeqCst);
        let manager = manager_with(factory.clone(), &["10.0.0.1:6379"], 1, None);

        let acquiring = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_client().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Failover clears the reserved slot while creation is in flight.
        manager
            .failover_to(
                Endpoint::parse_many(&["10.0.9.1:6379"]).unwrap(),
                Vec::new(),
            )
            .unwrap();

        factory.hold.store(false, Ordering::SeqCst);
        factory.gate.notify_waiters();

        let guard = acquiring.await.unwrap().unwrap();
        assert!(!guard.is_pooled());
        assert_eq!(manager.metrics().clients_created_outside_pool, 1);
    }

    #[tokio::test]
    async fn test_cancellation_does_not_strand_reservation() {
        let factory = Arc::new(PoolFactory::default());
        factory.hold.store(true, Ordering::SeqCst);
        let manager = manager_with(factory.clone(), &["10.0.0.1:6379"], 1, None);

        let acquiring = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_client().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        acquiring.abort();
        let _ = acquiring.await;

        // The rollback guard reverted the reservation; a later acquisition
        // claims the slot normally.
        factory.hold.store(false, Ordering::SeqCst);
        let guard = manager.get_client().await.unwrap();
        assert!(guard.is_pooled());
    }

    #[tokio::test]
    async fn test_failover_listeners_run_in_order_with_isolation() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 1, None);

        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            manager.on_failover(Box::new(move |event| {
                order.lock().unwrap().push(format!(
                    "first:{}",
                    event.masters[0].address()
                ));
                Err(FaroError::internal("listener one blew up"))
            }));
        }
        {
            let order = order.clone();
            manager.on_failover(Box::new(move |event| {
                order
                    .lock()
                    .unwrap()
                    .push(format!("second:{}", event.total_failovers));
                Ok(())
            }));
        }

        manager
            .failover_to(
                Endpoint::parse_many(&["10.0.9.1:6379"]).unwrap(),
                Vec::new(),
            )
            .unwrap();

        let calls = order.lock().unwrap().clone();
        assert_eq!(calls, vec!["first:10.0.9.1:6379", "second:1"]);
    }

    #[tokio::test]
    async fn test_stats_reflect_slot_states() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 2, None);

        let guard = manager.get_client().await.unwrap();
        let stats = manager.stats();
        assert_eq!(stats.write.pool_size, 2);
        assert_eq!(stats.write.in_use, 1);
        assert_eq!(stats.write.empty_slots, 1);
        assert_eq!(stats.counters.clients_created, 1);

        assert_eq!(manager.pool_active_states(), vec![1, -1]);
        drop(guard);
        assert_eq!(manager.pool_active_states(), vec![0, -1]);
    }

    #[tokio::test]
    async fn test_shutdown_clears_pools() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 1, None);

        let guard = manager.get_client().await.unwrap();
        drop(guard);
        manager.shutdown();

        let result = manager.get_client().await;
        assert!(matches!(result, Err(FaroError::Config(_))));
    }

    #[test]
    fn test_blocking_acquisition_outside_runtime() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 1, None);

        let guard = manager.get_client_blocking().unwrap();
        assert!(guard.is_pooled());
        drop(guard);

        let again = manager.get_read_only_client_blocking().unwrap();
        assert!(again.is_pooled());
    }

    #[tokio::test]
    async fn test_blocking_acquisition_inside_runtime_is_rejected() {
        let factory = Arc::new(PoolFactory::default());
        let manager = manager_with(factory, &["10.0.0.1:6379"], 1, None);

        let result = manager.get_client_blocking();
        assert!(matches!(result, Err(FaroError::Config(_))));
    }
}
