use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::breaker::DialBreaker;
use super::connection::Connection;
use super::dialer::{Dialer, TcpDialer};
use super::stats::{PoolGauges, PoolStats, StatsSnapshot};
use crate::config::PoolOptions;
use crate::utils::error::{Result, RpcPoolError};

/// Bounded pool of long-lived connections to a single endpoint.
///
/// At most `capacity` connections are checked out at once; further `get`s
/// wait up to `pool_timeout` for a slot. Returned connections are reused
/// most-recently-used first, connections idle for longer than `idle_timeout`
/// are evicted, and `min_idle` connections are dialed ahead of demand.
///
/// The handle is cheap to clone. Dropping the last handle stops the
/// background tasks; [`close`](Self::close) does the same explicitly and
/// shuts every socket down.
pub struct ConnectionPool<D: Dialer = TcpDialer> {
    pub(super) inner: Arc<PoolInner<D>>,
}

impl<D: Dialer> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.opts.endpoint)
            .field("capacity", &self.inner.opts.capacity)
            .field("closed", &self.inner.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

pub(super) struct PoolInner<D: Dialer> {
    pub(super) opts: PoolOptions,
    pub(super) dialer: D,
    pub(super) gate: Arc<Semaphore>,
    pub(super) state: Mutex<PoolState>,
    pub(super) breaker: DialBreaker,
    pub(super) stats: PoolStats,
    pub(super) shutdown: CancellationToken,
    /// Runtime the pool was built on. Background work is spawned here so
    /// `put`, `remove` and dropped checkouts work from any thread.
    pub(super) runtime: Handle,
    /// Signalled whenever a min-idle dial settles.
    pub(super) idle_ready: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    started: Instant,
    // Milliseconds since `started` plus one; zero means never accessed.
    last_access: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Bookkeeping guarded by the pool lock.
#[derive(Default)]
pub(super) struct PoolState {
    /// Closed flags of every live connection, idle or checked out.
    pub(super) all: HashMap<u64, Arc<AtomicBool>>,
    /// Oldest use at the front, newest at the back.
    pub(super) idle: VecDeque<Connection>,
    /// Connections counted against capacity, including reserved dials.
    pub(super) pool_size: usize,
    /// Min-idle dials in flight.
    pub(super) pending_idle: usize,
}

impl PoolState {
    /// Stop tracking a connection. Only connections still tracked give their
    /// capacity back, so forgetting twice is harmless.
    pub(super) fn forget(&mut self, id: u64, pooled: bool) -> bool {
        let tracked = self.all.remove(&id).is_some();
        if tracked && pooled {
            self.pool_size = self.pool_size.saturating_sub(1);
        }
        tracked
    }
}

impl ConnectionPool<TcpDialer> {
    /// Create a pool that dials plain TCP. Must be called inside a tokio
    /// runtime.
    pub fn new(options: PoolOptions) -> Self {
        Self::with_dialer(options, TcpDialer)
    }

    /// Positional constructor. Out-of-range values (zero capacity, zero
    /// timeouts) are replaced by defaults.
    pub fn connect(
        endpoint: impl Into<String>,
        capacity: usize,
        min_idle: usize,
        dial_timeout: Duration,
        idle_timeout: Option<Duration>,
        pool_timeout: Duration,
        idle_check_interval: Option<Duration>,
    ) -> Self {
        Self::new(
            PoolOptions::new(endpoint)
                .with_capacity(capacity)
                .with_min_idle(min_idle)
                .with_dial_timeout(dial_timeout)
                .with_idle_timeout(idle_timeout)
                .with_pool_timeout(pool_timeout)
                .with_idle_check_interval(idle_check_interval),
        )
    }
}

impl<D: Dialer> ConnectionPool<D> {
    /// Create a pool that opens sockets through `dialer`. Must be called
    /// inside a tokio runtime; the pool keeps a handle to it.
    pub fn with_dialer(options: PoolOptions, dialer: D) -> Self {
        let opts = options.normalized();
        let inner = Arc::new(PoolInner {
            gate: Arc::new(Semaphore::new(opts.capacity)),
            state: Mutex::new(PoolState {
                all: HashMap::with_capacity(opts.capacity),
                idle: VecDeque::with_capacity(opts.capacity),
                ..PoolState::default()
            }),
            breaker: DialBreaker::new(&opts.endpoint, opts.capacity),
            stats: PoolStats::new(),
            shutdown: CancellationToken::new(),
            runtime: Handle::current(),
            idle_ready: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            started: Instant::now(),
            last_access: AtomicU64::new(0),
            reaper: Mutex::new(None),
            dialer,
            opts,
        });

        if let (Some(interval), Some(_)) =
            (inner.opts.idle_check_interval, inner.opts.idle_timeout)
        {
            let handle = PoolInner::spawn_reaper(&inner, interval);
            *inner.reaper.lock() = Some(handle);
        }
        inner.check_min_idle();

        info!(
            endpoint = %inner.opts.endpoint,
            capacity = inner.opts.capacity,
            min_idle = inner.opts.min_idle,
            "Connection pool started"
        );

        Self { inner }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.opts
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.opts.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Free admission slots right now.
    pub fn available_permits(&self) -> usize {
        self.inner.gate.available_permits()
    }

    /// Check out a connection.
    ///
    /// Waits up to `pool_timeout` for an admission slot, then reuses the most
    /// recently returned idle connection (evicting stale ones on the way) or
    /// dials a new one. The slot stays with the returned checkout until it is
    /// handed to [`put`](Self::put) or [`remove`](Self::remove), or dropped.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close), `Timeout` when no slot frees in
    /// time, `Dial` when the dial fails and `CircuitOpen` while dialing is
    /// suspended. In every error case the caller holds no slot.
    pub async fn get(&self) -> Result<PooledConnection<D>> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(RpcPoolError::Closed);
        }
        inner.touch_access();

        let wait = inner.opts.pool_timeout;
        let permit = match timeout(wait, Arc::clone(&inner.gate).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RpcPoolError::Closed),
            Err(_) => {
                inner.stats.record_timeout();
                debug!("No pooled connection to {} within {:?}", inner.opts.endpoint, wait);
                return Err(RpcPoolError::Timeout(wait));
            }
        };

        // A min-idle dial in flight already holds the capacity this miss
        // would take, so wait for it once instead of dialing an overflow.
        let mut waited = false;
        loop {
            match inner.pop_idle()? {
                IdlePop::Found(conn) => {
                    inner.stats.record_hit();
                    trace!("Reusing pooled connection {} to {}", conn.id(), inner.opts.endpoint);
                    return Ok(inner.lease(conn, permit));
                }
                IdlePop::Pending(ready) if !waited => {
                    trace!("Waiting for pre-dialed connection to {}", inner.opts.endpoint);
                    let _ = timeout(inner.opts.dial_timeout, ready).await;
                    waited = true;
                }
                IdlePop::Pending(_) | IdlePop::Empty => break,
            }
        }

        inner.stats.record_miss();
        debug!("Pool miss for {}, creating new connection", inner.opts.endpoint);
        let stream = inner.new_connection().await?;
        inner.register(stream, permit)
    }

    /// Return a connection after a successful exchange.
    ///
    /// Pooled, healthy connections go back to the idle set. Overflow, broken
    /// or closed connections are discarded. The admission slot is released
    /// either way.
    ///
    /// # Errors
    ///
    /// `Closed` if the pool was closed meanwhile; the connection has been
    /// discarded.
    pub fn put(&self, checkout: PooledConnection<D>) -> Result<()> {
        let inner = &self.inner;
        inner.touch_access();
        let PooledConnection { mut conn, mut lease } = checkout;
        lease.settle();

        let pool_closed = {
            let mut state = inner.state.lock();
            if inner.is_closed() {
                state.forget(conn.id(), conn.is_pooled());
                true
            } else if conn.is_reusable() {
                conn.touch();
                state.idle.push_back(conn);
                return Ok(());
            } else {
                state.forget(conn.id(), conn.is_pooled());
                false
            }
        };

        trace!(
            "Discarding connection {} to {} (pooled: {}, broken: {})",
            conn.id(),
            inner.opts.endpoint,
            conn.is_pooled(),
            conn.is_broken()
        );
        conn.close_now();
        if pool_closed {
            return Err(RpcPoolError::Closed);
        }
        inner.check_min_idle();
        Ok(())
    }

    /// Discard a connection the protocol layer found broken mid-call.
    pub fn remove(&self, checkout: PooledConnection<D>, reason: impl fmt::Display) {
        let inner = &self.inner;
        let PooledConnection { mut conn, mut lease } = checkout;
        lease.settle();

        inner.state.lock().forget(conn.id(), conn.is_pooled());
        debug!(
            "Removing connection {} to {}: {}",
            conn.id(),
            inner.opts.endpoint,
            reason
        );
        conn.close_now();
        inner.check_min_idle();
    }

    /// Close the pool: stop background tasks, shut down idle sockets and mark
    /// checked-out connections closed so they are discarded on return.
    ///
    /// Only the first call does the work.
    ///
    /// # Errors
    ///
    /// `Closed` on every call after the first; otherwise the first socket
    /// shutdown error, if any.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RpcPoolError::Closed);
        }

        inner.shutdown.cancel();
        inner.gate.close();
        inner.idle_ready.notify_waiters();
        if let Some(handle) = inner.reaper.lock().take() {
            handle.abort();
        }

        let (idle, flags) = {
            let mut state = inner.state.lock();
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            let flags: Vec<Arc<AtomicBool>> = state.all.drain().map(|(_, flag)| flag).collect();
            state.pool_size = 0;
            state.pending_idle = 0;
            (idle, flags)
        };

        for flag in &flags {
            flag.store(true, Ordering::Release);
        }

        let mut first_err = None;
        for mut conn in idle {
            if let Err(e) = conn.close().await {
                warn!("Failed to close connection {}: {}", conn.id(), e);
                first_err.get_or_insert(e);
            }
        }

        info!(
            endpoint = %inner.opts.endpoint,
            connections = flags.len(),
            "Connection pool closed"
        );

        match first_err {
            Some(e) => Err(RpcPoolError::Io(e)),
            None => Ok(()),
        }
    }

    /// Snapshot of pool counters and sizes.
    pub fn stats(&self) -> StatsSnapshot {
        let inner = &self.inner;
        let gauges = {
            let state = inner.state.lock();
            PoolGauges {
                total_conns: state.all.len(),
                idle_conns: state.idle.len(),
                pool_size: state.pool_size,
                last_access_ms_ago: inner.last_access_ms_ago(),
            }
        };
        inner.stats.snapshot(gauges)
    }
}

impl<D: Dialer> PoolInner<D> {
    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch_access(&self) {
        let now = self.started.elapsed().as_millis() as u64 + 1;
        self.last_access.store(now, Ordering::Relaxed);
    }

    fn last_access_ms_ago(&self) -> Option<u64> {
        match self.last_access.load(Ordering::Relaxed) {
            0 => None,
            at => Some((self.started.elapsed().as_millis() as u64 + 1).saturating_sub(at)),
        }
    }

    /// Pop the most recently used idle connection, closing stale ones. When
    /// the idle set is empty but min-idle dials are in flight, hands back a
    /// wakeup registered before the lock was released.
    fn pop_idle(self: &Arc<Self>) -> Result<IdlePop<'_>> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(RpcPoolError::Closed);
            }
            loop {
                match state.idle.pop_back() {
                    Some(conn) if conn.is_stale(self.opts.idle_timeout, now) => {
                        state.forget(conn.id(), true);
                        stale.push(conn);
                    }
                    Some(conn) => break IdlePop::Found(conn),
                    None if state.pending_idle > 0 => break IdlePop::Pending(self.idle_ready.notified()),
                    None => break IdlePop::Empty,
                }
            }
        };

        if !stale.is_empty() {
            debug!(
                "Discarded {} expired connections to {}",
                stale.len(),
                self.opts.endpoint
            );
            self.stats.record_stale(stale.len() as u64);
            for mut conn in stale {
                conn.close_now();
            }
        }

        self.check_min_idle();
        Ok(found)
    }

    /// Dial through the circuit breaker.
    pub(super) async fn new_connection(self: &Arc<Self>) -> Result<TcpStream> {
        self.breaker.check()?;

        match self
            .dialer
            .dial(&self.opts.endpoint, self.opts.dial_timeout)
            .await
        {
            Ok(stream) => {
                self.stats.record_dial(true);
                self.breaker.record_success();
                Ok(stream)
            }
            Err(e) => {
                self.stats.record_dial(false);
                warn!("Failed to dial {}: {}", self.opts.endpoint, e);
                let err = Arc::new(e);
                if self.breaker.record_failure(Arc::clone(&err)) {
                    self.spawn_recovery_probe();
                }
                Err(RpcPoolError::Dial {
                    endpoint: self.opts.endpoint.clone(),
                    source: err,
                })
            }
        }
    }

    pub(super) fn make_connection(&self, stream: TcpStream, pooled: bool) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Connection::new(id, &self.opts.endpoint, stream, pooled)
            .with_io_timeouts(self.opts.read_timeout, self.opts.write_timeout)
    }

    /// Track a freshly dialed socket and hand it out. It counts against
    /// capacity only if there is room; otherwise it is a one-shot overflow
    /// connection.
    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledConnection<D>> {
        let conn = {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(RpcPoolError::Closed);
            }
            let pooled = state.pool_size < self.opts.capacity;
            if pooled {
                state.pool_size += 1;
            }
            let conn = self.make_connection(stream, pooled);
            state.all.insert(conn.id(), conn.closed_flag());
            conn
        };

        if !conn.is_pooled() {
            debug!(
                "Pool for {} at capacity, connection {} is overflow",
                self.opts.endpoint,
                conn.id()
            );
        }
        Ok(self.lease(conn, permit))
    }

    fn lease(self: &Arc<Self>, conn: Connection, permit: OwnedSemaphorePermit) -> PooledConnection<D> {
        let lease = Lease {
            pool: Arc::downgrade(self),
            permit: Some(permit),
            conn_id: conn.id(),
            pooled: conn.is_pooled(),
            closed: conn.closed_flag(),
            settled: false,
        };
        PooledConnection { conn, lease }
    }
}

enum IdlePop<'a> {
    Found(Connection),
    Pending(Notified<'a>),
    Empty,
}

impl<D: Dialer> Drop for PoolInner<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A checked-out connection. Dereferences to [`Connection`].
///
/// Hand it back with [`ConnectionPool::put`] or [`ConnectionPool::remove`].
/// Dropping it instead discards the socket and frees its slot, since the
/// state of an abandoned exchange is unknown.
pub struct PooledConnection<D: Dialer = TcpDialer> {
    conn: Connection,
    lease: Lease<D>,
}

impl<D: Dialer> Deref for PooledConnection<D> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl<D: Dialer> DerefMut for PooledConnection<D> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl<D: Dialer> fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

// Owns the admission slot of one checkout. The slot is released when the
// lease drops, which happens exactly once per checkout.
struct Lease<D: Dialer> {
    pool: Weak<PoolInner<D>>,
    permit: Option<OwnedSemaphorePermit>,
    conn_id: u64,
    pooled: bool,
    closed: Arc<AtomicBool>,
    settled: bool,
}

impl<D: Dialer> Lease<D> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl<D: Dialer> Drop for Lease<D> {
    fn drop(&mut self) {
        if !self.settled {
            self.closed.store(true, Ordering::Release);
            if let Some(pool) = self.pool.upgrade() {
                pool.state.lock().forget(self.conn_id, self.pooled);
                debug!(
                    "Connection {} to {} dropped without put/remove, discarding",
                    self.conn_id, pool.opts.endpoint
                );
                pool.check_min_idle();
            }
        }
        // Release the slot last, outside the pool lock.
        drop(self.permit.take());
    }
}
