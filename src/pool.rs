//! PostgreSQL connection pool.
//!
//! The pool owns up to `max_connections` clients. Idle clients are handed
//! out most recently used first; when none is idle and the pool is full,
//! callers wait in a FIFO queue. A released client goes straight to the
//! oldest waiter instead of passing through the idle list.
//!
//! All pool state sits behind one mutex and every event (acquire, release,
//! eviction, end) updates it in a single critical section, so no observer
//! ever sees more than `max_connections` clients or a client leased twice.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::client::Client;
use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::result::QueryResult;
use crate::transport::{Connector, TcpConnector};
use crate::types::PgValue;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections
    pub max_connections: usize,
    /// Close idle connections after this long; `None` keeps them forever
    pub idle_timeout: Option<Duration>,
    /// Give up waiting for a connection after this long
    pub acquire_timeout: Option<Duration>,
    /// Bound on establishing one new connection
    pub connect_timeout: Option<Duration>,
    /// Replace a connection after it has been leased this many times
    pub max_uses: Option<u32>,
    /// How often the eviction task scans idle connections
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Some(Duration::from_secs(10)),
            acquire_timeout: None,
            connect_timeout: None,
            max_uses: None,
            reap_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn max_uses(mut self, uses: u32) -> Self {
        self.max_uses = Some(uses);
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiting: usize,
}

// ============================================================================
// Pool Inner
// ============================================================================

/// A pooled client and its lease count.
struct Member {
    client: Client,
    uses: u32,
}

struct IdleMember {
    id: u64,
    member: Member,
    since: Instant,
    _watch: Option<IdleWatch>,
}

/// Task that pulls an idle client out of the pool when its connection
/// closes. Stopped when the client leaves the idle list.
struct IdleWatch(AbortHandle);

impl Drop for IdleWatch {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What a waiter is handed.
enum Grant {
    /// A released, healthy client
    Client(Member),
    /// Capacity freed by a destroyed client; the waiter connects itself
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PgResult<Grant>>,
}

#[derive(Default)]
struct PoolState {
    /// Most recently released at the back
    idle: VecDeque<IdleMember>,
    waiters: VecDeque<Waiter>,
    /// Idle + leased + connecting
    total: usize,
    ending: bool,
    next_waiter: u64,
    next_idle: u64,
}

struct PoolInner {
    config: PoolConfig,
    pg_config: Arc<PgConfig>,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    /// Signalled when `total` drops to zero after `end`
    drained: Notify,
}

impl PoolInner {
    fn remove_one(&self, state: &mut PoolState) {
        state.total -= 1;
        if state.ending && state.total == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Give `grant` to the oldest live waiter, or hand it back.
    fn hand_off(state: &mut PoolState, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Ok(grant)) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "served waiter");
                    return None;
                }
                Err(Ok(returned)) => grant = returned,
                Err(Err(_)) => return None,
            }
        }
        Some(grant)
    }

    /// Free one unit of capacity, passing it to a waiter if any.
    fn free_slot(&self, state: &mut PoolState) {
        if !state.ending && Self::hand_off(state, Grant::Slot).is_none() {
            return;
        }
        self.remove_one(state);
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        self.free_slot(&mut state);
    }

    /// Take back a leased client, counting the lease as a use.
    fn release(self: &Arc<Self>, mut member: Member, broken: bool) {
        member.uses += 1;
        self.restore(member, broken);
    }

    /// Put a client back without counting a use.
    fn restore(self: &Arc<Self>, member: Member, broken: bool) {
        let worn_out = self.config.max_uses.is_some_and(|max| member.uses >= max);

        let mut state = self.state.lock();
        if broken || worn_out || state.ending || member.client.is_closed() {
            debug!(broken, worn_out, uses = member.uses, "destroying pooled connection");
            self.free_slot(&mut state);
            drop(state);
            drop(member);
            return;
        }

        match Self::hand_off(&mut state, Grant::Client(member)) {
            None => {}
            Some(Grant::Client(member)) => {
                let id = state.next_idle;
                state.next_idle += 1;
                let watch = spawn_idle_watch(self, id, member.client.closed_signal());
                state.idle.push_back(IdleMember {
                    id,
                    member,
                    since: Instant::now(),
                    _watch: watch,
                });
            }
            Some(Grant::Slot) => {}
        }
    }

    /// Drop an idle client whose connection closed.
    fn remove_idle(&self, id: u64) {
        let removed = {
            let mut state = self.state.lock();
            let Some(pos) = state.idle.iter().position(|idle| idle.id == id) else {
                return;
            };
            let removed = state.idle.remove(pos);
            self.free_slot(&mut state);
            removed
        };
        debug!("removed closed idle connection");
        drop(removed);
    }

    /// Drop idle connections that closed or sat unused too long.
    ///
    /// Returns false once the pool is ending.
    fn reap(&self) -> bool {
        let expired: Vec<IdleMember> = {
            let mut state = self.state.lock();
            if state.ending {
                return false;
            }
            let timeout = self.config.idle_timeout;
            let (expired, keep): (Vec<_>, Vec<_>) = state.idle.drain(..).partition(|idle| {
                idle.member.client.is_closed()
                    || timeout.is_some_and(|t| idle.since.elapsed() >= t)
            });
            state.idle = keep.into();
            state.total -= expired.len();
            expired
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted idle connections");
        }
        // Dropping a client lets its driver send Terminate
        drop(expired);
        true
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection {
    /// The leased client (None once returned to the pool)
    member: Option<Member>,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl PooledConnection {
    fn new(member: Member, pool: Arc<PoolInner>) -> Self {
        Self {
            member: Some(member),
            pool,
            broken: false,
        }
    }

    /// Return the connection to the pool.
    pub fn release(self) {}

    /// Return the connection after a failure; fatal errors destroy it.
    pub fn release_with_error(mut self, err: &PgError) {
        if err.is_fatal() {
            self.broken = true;
        }
    }

    /// Destroy the connection instead of returning it.
    pub fn detach(mut self) {
        self.broken = true;
    }

    /// Times this connection has been leased before this lease.
    pub fn uses(&self) -> u32 {
        self.member.as_ref().map_or(0, |m| m.uses)
    }
}

impl Deref for PooledConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self
            .member
            .as_ref()
            .expect("pooled connection used after release")
            .client
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(member) = self.member.take() {
            self.pool.release(member, self.broken);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("client", &self.member.as_ref().map(|m| &m.client))
            .field("uses", &self.uses())
            .finish()
    }
}

/// A queued acquire. Dropping it (timeout or caller cancellation) takes it
/// out of the queue, or gives back whatever it was already granted.
struct WaiterGuard {
    pool: Arc<PoolInner>,
    id: u64,
    rx: Option<oneshot::Receiver<PgResult<Grant>>>,
}

impl WaiterGuard {
    async fn wait(&mut self) -> PgResult<Grant> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(PgError::PoolShutdown);
        };
        let grant = rx.await;
        self.rx = None;
        grant.map_err(|_| PgError::PoolShutdown)?
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        {
            let mut state = self.pool.state.lock();
            if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
                state.waiters.remove(pos);
                return;
            }
        }
        match rx.try_recv() {
            // Never leased, so not a use
            Ok(Ok(Grant::Client(member))) => self.pool.restore(member, false),
            Ok(Ok(Grant::Slot)) => self.pool.release_slot(),
            _ => {}
        }
    }
}

/// Capacity reserved for a connection being established.
struct SlotGuard {
    pool: Option<Arc<PoolInner>>,
}

impl SlotGuard {
    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_slot();
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// Connections are created on demand; each keeps its own prepared statement
/// cache. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Create a pool that connects over TCP.
    pub fn new(pg_config: PgConfig, config: PoolConfig) -> Self {
        Self::with_connector(Arc::new(pg_config), config, Arc::new(TcpConnector))
    }

    pub fn with_connector(
        pg_config: Arc<PgConfig>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            pg_config,
            connector,
            state: Mutex::new(PoolState::default()),
            drained: Notify::new(),
        });
        spawn_reaper(&inner);
        Self { inner }
    }

    /// Get a connection from the pool.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        self.acquire_within(self.inner.config.acquire_timeout).await
    }

    /// Get a connection, waiting at most `timeout` instead of the
    /// configured acquire timeout.
    pub async fn acquire_timeout(&self, timeout: Duration) -> PgResult<PooledConnection> {
        self.acquire_within(Some(timeout)).await
    }

    async fn acquire_within(&self, timeout: Option<Duration>) -> PgResult<PooledConnection> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_inner())
                .await
                .map_err(|_| {
                    PgError::Timeout(format!("timed out after {:?} waiting for a connection", limit))
                })?,
            None => self.acquire_inner().await,
        }
    }

    async fn acquire_inner(&self) -> PgResult<PooledConnection> {
        let mut waiter = {
            let mut state = self.inner.state.lock();
            if state.ending {
                return Err(PgError::PoolShutdown);
            }

            while let Some(idle) = state.idle.pop_back() {
                if idle.member.client.is_closed() {
                    self.inner.remove_one(&mut state);
                    continue;
                }
                trace!(uses = idle.member.uses, "reusing idle connection");
                return Ok(PooledConnection::new(idle.member, Arc::clone(&self.inner)));
            }

            if state.total < self.inner.config.max_connections {
                state.total += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter;
                state.next_waiter += 1;
                state.waiters.push_back(Waiter { id, tx });
                trace!(waiter = id, queued = state.waiters.len(), "pool exhausted, waiting");
                Some(WaiterGuard {
                    pool: Arc::clone(&self.inner),
                    id,
                    rx: Some(rx),
                })
            }
        };

        let grant = match waiter.as_mut() {
            Some(waiter) => waiter.wait().await?,
            None => Grant::Slot,
        };
        match grant {
            Grant::Client(member) => Ok(PooledConnection::new(member, Arc::clone(&self.inner))),
            Grant::Slot => self.connect().await,
        }
    }

    /// Establish a connection in an already reserved slot.
    async fn connect(&self) -> PgResult<PooledConnection> {
        let slot = SlotGuard {
            pool: Some(Arc::clone(&self.inner)),
        };
        let connecting = Client::connect_with(
            Arc::clone(&self.inner.pg_config),
            Arc::clone(&self.inner.connector),
        );
        let client = match self.inner.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| PgError::Timeout(format!("connecting took longer than {:?}", limit)))?,
            None => connecting.await,
        };
        let client = match client {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "pool failed to open a connection");
                return Err(e);
            }
        };
        slot.disarm();

        debug!(pid = ?client.process_id(), "pool opened a connection");
        Ok(PooledConnection::new(
            Member { client, uses: 0 },
            Arc::clone(&self.inner),
        ))
    }

    /// Execute a simple query on a pooled connection.
    pub async fn simple_query(&self, query: &str) -> PgResult<Vec<QueryResult>> {
        let conn = self.acquire().await?;
        let result = conn.simple_query(query).await;
        finish(conn, result)
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, query: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let conn = self.acquire().await?;
        let result = conn.query(query, params).await;
        finish(conn, result)
    }

    /// Execute a query without returning results (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, query: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(query, params).await?.rows_affected())
    }

    /// Shut the pool down.
    ///
    /// Queued acquires fail with [`PgError::PoolShutdown`], idle connections
    /// are closed, and leased ones are closed as they are released. Resolves
    /// once every connection is gone. Calling it again just waits.
    pub async fn end(&self) {
        let (waiters, idle) = {
            let mut state = self.inner.state.lock();
            if !state.ending {
                debug!(total = state.total, "ending pool");
            }
            state.ending = true;
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let idle: Vec<IdleMember> = state.idle.drain(..).collect();
            state.total -= idle.len();
            if state.total == 0 {
                self.inner.drained.notify_waiters();
            }
            (waiters, idle)
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(PgError::PoolShutdown));
        }
        for idle in idle {
            let _ = idle.member.client.close().await;
        }

        loop {
            let drained = self.inner.drained.notified();
            if self.inner.state.lock().total == 0 {
                break;
            }
            drained.await;
        }
    }

    pub fn is_ending(&self) -> bool {
        self.inner.state.lock().ending
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            total: state.total,
            idle: state.idle.len(),
            busy: state.total - state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("status", &self.status())
            .finish()
    }
}

/// Release after a one-shot call, destroying the lease on fatal errors.
fn finish<T>(conn: PooledConnection, result: PgResult<T>) -> PgResult<T> {
    match &result {
        Err(e) => conn.release_with_error(e),
        Ok(_) => conn.release(),
    }
    result
}

fn spawn_idle_watch(
    inner: &Arc<PoolInner>,
    id: u64,
    mut closed: watch::Receiver<bool>,
) -> Option<IdleWatch> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let pool: Weak<PoolInner> = Arc::downgrade(inner);
    let task = runtime.spawn(async move {
        let _ = closed.wait_for(|closed| *closed).await;
        if let Some(pool) = pool.upgrade() {
            pool.remove_idle(id);
        }
    });
    Some(IdleWatch(task.abort_handle()))
}

fn spawn_reaper(inner: &Arc<PoolInner>) {
    let pool: Weak<PoolInner> = Arc::downgrade(inner);
    let period = inner.config.reap_interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if !pool.reap() {
                break;
            }
        }
        trace!("pool reaper stopped");
    });
}
