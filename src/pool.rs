//! Connection pool over a [`ServerSet`].
//!
//! Every slot carries its own atomic state word; checkout, release and the
//! background sweep move a slot between states with compare-and-swap, so a
//! connection is owned by exactly one party at a time and unrelated slots
//! never contend. The connection itself sits in a per-slot mutex that is only
//! touched by the current owner of the slot.

use crate::connection::LdapConnection;
use crate::error::{LdapError, Result};
use crate::health_check::HealthCheck;
use crate::metrics::{PoolStatistics, PoolStatisticsSnapshot};
use crate::server_set::ServerSet;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Connections opened when the pool is created.
    pub initial_connections: usize,
    pub max_connections: usize,
    /// How long checkout blocks when the pool is at capacity. Zero fails at once.
    pub max_wait: Duration,
    /// Connections older than this are closed by the sweep and on release.
    pub max_connection_age: Option<Duration>,
    pub health_check_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            initial_connections: 1,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_wait: Duration::ZERO,
            max_connection_age: None,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }
}

/// Summary of one background sweep. `num_expired` and `num_defunct` are
/// disjoint subsets of `num_examined`; the rest went back to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub num_examined: usize,
    pub num_expired: usize,
    pub num_defunct: usize,
}

impl HealthCheckResult {
    pub fn num_still_available(&self) -> usize {
        self.num_examined - self.num_expired - self.num_defunct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    /// Reserved while a new connection is being opened into it.
    Connecting = 1,
    Available = 2,
    CheckedOut = 3,
    /// Held by the sweep or by `close`.
    Checking = 4,
    Defunct = 5,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Connecting,
            2 => SlotState::Available,
            3 => SlotState::CheckedOut,
            4 => SlotState::Checking,
            5 => SlotState::Defunct,
            _ => SlotState::Empty,
        }
    }
}

struct Slot {
    state: AtomicU8,
    conn: Mutex<Option<LdapConnection>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Empty as u8),
            conn: Mutex::new(None),
        }
    }

    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, to: SlotState) {
        self.state.store(to as u8, Ordering::Release);
    }

    fn guard(&self) -> MutexGuard<'_, Option<LdapConnection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Option<LdapConnection> {
        self.guard().take()
    }

    fn put(&self, conn: LdapConnection) {
        *self.guard() = Some(conn);
    }
}

/// Exclusive claim on one slot. Dropping it without handing the slot on
/// empties the slot and wakes a waiter, so a cancelled checkout, release or
/// sweep never strands capacity.
struct SlotReservation {
    pool: Arc<PoolInner>,
    idx: usize,
    armed: bool,
}

impl SlotReservation {
    fn hand_out(mut self, conn: LdapConnection) -> PooledConnection {
        self.armed = false;
        self.pool.slots[self.idx].set(SlotState::CheckedOut);
        PooledConnection {
            pool: Arc::clone(&self.pool),
            slot: self.idx,
            conn: Some(conn),
        }
    }

    fn fill(mut self, conn: LdapConnection) {
        self.armed = false;
        self.pool.put_back(self.idx, conn);
    }

    /// Open a new connection into the slot. A failure leaves the slot empty
    /// and is recorded, never returned.
    async fn refill(self) {
        let pool = Arc::clone(&self.pool);
        if pool.closed.load(Ordering::Acquire) {
            return;
        }
        pool.slots[self.idx].set(SlotState::Connecting);
        match pool.open().await {
            Ok(mut conn) => {
                if pool.closed.load(Ordering::Acquire) {
                    conn.close().await;
                } else {
                    self.fill(conn);
                }
            }
            Err(e) => {
                pool.stats.inc_replacement_failures();
                warn!("Unable to replace pooled connection: {}", e);
            }
        }
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.vacate(self.idx);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Defunct,
    Expired,
    Unneeded,
}

struct PoolInner {
    server_set: ServerSet,
    health_check: Option<Arc<dyn HealthCheck>>,
    options: PoolOptions,
    slots: Box<[Slot]>,
    cursor: AtomicUsize,
    notify: Notify,
    closed: AtomicBool,
    stats: PoolStatistics,
    last_health_check: ArcSwapOption<HealthCheckResult>,
}

impl PoolInner {
    fn is_expired(&self, conn: &LdapConnection) -> bool {
        self.options
            .max_connection_age
            .is_some_and(|max_age| conn.age() >= max_age)
    }

    /// Slot indexes starting at a rotating cursor so checkouts spread over the pool.
    fn scan_order(&self) -> impl Iterator<Item = usize> {
        let n = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n.max(1);
        (0..n).map(move |i| (start + i) % n)
    }

    fn claim_available(&self) -> Option<(usize, LdapConnection)> {
        for idx in self.scan_order() {
            let slot = &self.slots[idx];
            if slot.transition(SlotState::Available, SlotState::CheckedOut) {
                match slot.take() {
                    Some(conn) => return Some((idx, conn)),
                    None => slot.set(SlotState::Empty),
                }
            }
        }
        None
    }

    /// Take ownership of a slot already moved out of `Available` or `Empty`.
    fn reserve(self: &Arc<Self>, idx: usize) -> SlotReservation {
        SlotReservation {
            pool: Arc::clone(self),
            idx,
            armed: true,
        }
    }

    fn reserve_empty(&self) -> Option<usize> {
        self.scan_order()
            .find(|&idx| self.slots[idx].transition(SlotState::Empty, SlotState::Connecting))
    }

    async fn open(&self) -> Result<LdapConnection> {
        match self.server_set.get_connection(self.health_check.as_deref()).await {
            Ok(conn) => {
                self.stats.inc_connections_created();
                debug!("Pool opened connection to {}", conn.address());
                Ok(conn)
            }
            Err(e) => {
                self.stats.inc_failed_connection_attempts();
                Err(e)
            }
        }
    }

    fn put_back(&self, idx: usize, conn: LdapConnection) {
        let slot = &self.slots[idx];
        slot.put(conn);
        slot.set(SlotState::Available);
        self.notify.notify_one();
    }

    fn vacate(&self, idx: usize) {
        self.slots[idx].set(SlotState::Empty);
        self.notify.notify_one();
    }

    async fn discard(&self, conn: &mut LdapConnection, reason: CloseReason) {
        match reason {
            CloseReason::Defunct => self.stats.inc_closed_defunct(),
            CloseReason::Expired => self.stats.inc_closed_expired(),
            CloseReason::Unneeded => self.stats.inc_closed_unneeded(),
        }
        debug!("Closing {:?} connection to {}", reason, conn.address());
        conn.close().await;
    }

    /// Return path used when a guard is dropped without `release`.
    fn return_unchecked(self: &Arc<Self>, idx: usize, conn: LdapConnection) {
        let reservation = self.reserve(idx);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !conn.is_closed() {
            self.stats.record_release(true);
            reservation.fill(conn);
            return;
        }
        self.stats.record_release(false);
        self.stats.inc_closed_defunct();
        self.slots[idx].set(SlotState::Defunct);
        drop(conn);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reservation.refill());
        }
    }

    async fn sweep(self: &Arc<Self>) -> HealthCheckResult {
        let mut result = HealthCheckResult::default();
        for idx in 0..self.slots.len() {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let slot = &self.slots[idx];
            if !slot.transition(SlotState::Available, SlotState::Checking) {
                continue;
            }
            let reservation = self.reserve(idx);
            let Some(mut conn) = slot.take() else {
                continue;
            };
            result.num_examined += 1;

            if self.is_expired(&conn) {
                result.num_expired += 1;
                self.discard(&mut conn, CloseReason::Expired).await;
                reservation.refill().await;
                continue;
            }

            let healthy = if conn.is_closed() {
                false
            } else if let Some(ref check) = self.health_check {
                match check.ensure_connection_valid_for_continued_use(&mut conn).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Pooled connection to {} failed health check: {}", conn.address(), e);
                        false
                    }
                }
            } else {
                true
            };

            if healthy && !conn.is_closed() {
                reservation.fill(conn);
            } else {
                result.num_defunct += 1;
                slot.set(SlotState::Defunct);
                self.discard(&mut conn, CloseReason::Defunct).await;
                reservation.refill().await;
            }
        }
        self.stats.inc_health_check_runs();
        self.last_health_check.store(Some(Arc::new(result)));
        result
    }
}

/// Pool of authenticated connections obtained through a [`ServerSet`].
#[derive(Clone)]
pub struct LdapConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for LdapConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnectionPool")
            .field("server_set", &self.inner.server_set)
            .field("options", &self.inner.options)
            .field("current_size", &self.current_size())
            .field("available", &self.available_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LdapConnectionPool {
    /// Create the pool and open the initial connections. Individual failures
    /// are tolerated; the pool fails only when none of them could be opened.
    pub async fn new(
        server_set: ServerSet,
        health_check: Option<Arc<dyn HealthCheck>>,
        mut options: PoolOptions,
    ) -> Result<Self> {
        if options.max_connections == 0 {
            warn!("max_connections is 0, using 1");
            options.max_connections = 1;
        }
        if options.initial_connections > options.max_connections {
            warn!(
                "initial_connections {} exceeds max_connections {}, clamping",
                options.initial_connections, options.max_connections
            );
            options.initial_connections = options.max_connections;
        }
        let slots: Box<[Slot]> = (0..options.max_connections).map(|_| Slot::new()).collect();
        let initial = options.initial_connections;
        let pool = Self {
            inner: Arc::new(PoolInner {
                server_set,
                health_check,
                options,
                slots,
                cursor: AtomicUsize::new(0),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                stats: PoolStatistics::new(),
                last_health_check: ArcSwapOption::empty(),
            }),
        };

        let mut last_error = None;
        let mut opened = 0;
        for idx in 0..initial {
            pool.inner.slots[idx].set(SlotState::Connecting);
            let reservation = pool.inner.reserve(idx);
            match pool.inner.open().await {
                Ok(conn) => {
                    reservation.fill(conn);
                    opened += 1;
                }
                Err(e) => {
                    warn!("Failed to open initial pooled connection: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if opened == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        info!("Connection pool ready: {}/{} connections", opened, pool.inner.options.max_connections);
        Ok(pool)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn server_set(&self) -> &ServerSet {
        &self.inner.server_set
    }

    pub fn statistics(&self) -> PoolStatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn render_prometheus(&self) -> String {
        self.inner.stats.render_prometheus(
            self.current_size(),
            self.available_count(),
            &self.inner.server_set.candidate_states(),
        )
    }

    /// Result of the most recent sweep, if one has run.
    pub fn last_health_check_result(&self) -> Option<HealthCheckResult> {
        self.inner.last_health_check.load_full().map(|r| *r)
    }

    pub fn available_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|s| s.state() == SlotState::Available)
            .count()
    }

    /// Connections held by the pool in any state, including checked out.
    pub fn current_size(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|s| s.state() != SlotState::Empty)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn checkout(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let max_wait = inner.options.max_wait;
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut waited = false;

        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.closed.load(Ordering::Acquire) {
                inner.stats.inc_checkouts_failed();
                return Err(LdapError::PoolClosed);
            }

            // Each reservation below empties its slot if this future is dropped.
            if let Some((idx, mut conn)) = inner.claim_available() {
                let reservation = inner.reserve(idx);
                if conn.is_closed() {
                    inner.discard(&mut conn, CloseReason::Defunct).await;
                    continue;
                }
                if inner.is_expired(&conn) {
                    inner.discard(&mut conn, CloseReason::Expired).await;
                    continue;
                }
                if let Some(ref check) = inner.health_check {
                    if let Err(e) = check.ensure_connection_valid_for_checkout(&mut conn).await {
                        warn!("Evicting connection to {} at checkout: {}", conn.address(), e);
                        inner.discard(&mut conn, CloseReason::Defunct).await;
                        continue;
                    }
                }
                inner.stats.record_checkout(waited.then(|| started.elapsed()));
                return Ok(reservation.hand_out(conn));
            }

            if let Some(idx) = inner.reserve_empty() {
                let reservation = inner.reserve(idx);
                match inner.open().await {
                    Ok(conn) => {
                        inner.stats.record_checkout(waited.then(|| started.elapsed()));
                        return Ok(reservation.hand_out(conn));
                    }
                    Err(e) => {
                        drop(reservation);
                        inner.stats.inc_checkouts_failed();
                        return Err(e);
                    }
                }
            }

            if max_wait.is_zero() {
                inner.stats.inc_checkouts_failed();
                return Err(LdapError::PoolExhausted);
            }
            let now = Instant::now();
            if now >= deadline {
                inner.stats.inc_checkouts_failed();
                return Err(LdapError::CheckoutTimeout(max_wait));
            }
            waited = true;
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                inner.stats.inc_checkouts_failed();
                return Err(LdapError::CheckoutTimeout(max_wait));
            }
        }
    }

    /// Run one sweep over the available connections.
    pub async fn run_health_check(&self) -> HealthCheckResult {
        let result = self.inner.sweep().await;
        if result.num_expired > 0 || result.num_defunct > 0 {
            info!(
                "Pool health check: examined={} expired={} defunct={}",
                result.num_examined, result.num_expired, result.num_defunct
            );
        } else {
            debug!("Pool health check: examined={} all healthy", result.num_examined);
        }
        result
    }

    /// Sweep every `health_check_interval` until the pool is closed or dropped.
    pub fn spawn_health_check_task(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.options.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                LdapConnectionPool { inner }.run_health_check().await;
            }
            debug!("Pool health check task stopped");
        })
    }

    /// Close every idle connection and refuse further checkouts. Connections
    /// still checked out are closed when they come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();
        for (idx, slot) in self.inner.slots.iter().enumerate() {
            if slot.transition(SlotState::Available, SlotState::Checking) {
                let _reservation = self.inner.reserve(idx);
                if let Some(mut conn) = slot.take() {
                    self.inner.discard(&mut conn, CloseReason::Unneeded).await;
                }
            }
        }
        info!("Connection pool closed");
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool
/// as available without checking it; use [`PooledConnection::release`] to
/// report its health.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    slot: usize,
    conn: Option<LdapConnection>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    pub fn connection(&self) -> Result<&LdapConnection> {
        self.conn.as_ref().ok_or(LdapError::ConnectionClosed)
    }

    pub fn connection_mut(&mut self) -> Result<&mut LdapConnection> {
        self.conn.as_mut().ok_or(LdapError::ConnectionClosed)
    }

    pub fn address(&self) -> String {
        self.conn.as_ref().map(|c| c.address()).unwrap_or_default()
    }

    /// Give the connection back. An unhealthy connection, one that fails the
    /// release check or one past its maximum age is closed and replaced;
    /// a replacement failure is only recorded in the statistics.
    pub async fn release(mut self, healthy: bool) {
        let Some(mut conn) = self.conn.take() else { return };
        let pool = Arc::clone(&self.pool);
        let idx = self.slot;
        let reservation = pool.reserve(idx);

        if pool.closed.load(Ordering::Acquire) {
            pool.discard(&mut conn, CloseReason::Unneeded).await;
            return;
        }

        let mut valid = healthy && !conn.is_closed();
        if valid {
            if let Some(ref check) = pool.health_check {
                if let Err(e) = check.ensure_connection_valid_for_release(&mut conn).await {
                    warn!("Connection to {} failed release check: {}", conn.address(), e);
                    valid = false;
                }
            }
        }
        pool.stats.record_release(valid);

        if !valid {
            pool.slots[idx].set(SlotState::Defunct);
            pool.discard(&mut conn, CloseReason::Defunct).await;
            reservation.refill().await;
        } else if pool.is_expired(&conn) {
            pool.discard(&mut conn, CloseReason::Expired).await;
            reservation.refill().await;
        } else {
            reservation.fill(conn);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_unchecked(self.slot, conn);
        }
    }
}
