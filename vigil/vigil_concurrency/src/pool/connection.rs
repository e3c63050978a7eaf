//! Bounded pooling of external-service connections.
//!
//! A [`ConnectionPool`] hands out [`PooledConnection`] handles that return
//! their connection when dropped. The pool never holds more than `max_size`
//! connections, counting idle ones, checked-out ones and those still being
//! created. A background sweeper closes connections that have been idle for
//! longer than `idle_timeout`, keeping at least `min_size` around.
//!
//! Connection creation, validation and closing all run outside the pool
//! lock.

use crate::sync::AtomicCounter;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use vigil_core::config::ConnectionPoolConfig;
use vigil_core::error::PoolError;
use vigil_core::id::{ConnectionId, PoolId};
use vigil_core::traits::{Connection, ConnectionFactory};

/// Statistics about a connection pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionPoolStats {
    /// Connections opened by the factory
    pub created: usize,

    /// Connections closed by the pool for any reason
    pub closed: usize,

    /// Connections closed by the idle sweep
    pub evicted: usize,

    /// `get` calls rejected because the pool was at capacity
    pub exhausted: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicCounter,
    closed: AtomicCounter,
    evicted: AtomicCounter,
    exhausted: AtomicCounter,
}

struct IdleConnection<C> {
    id: ConnectionId,
    conn: C,
    idle_since: Instant,
}

struct PoolState<C> {
    /// Oldest at the front; `get` takes from the back
    idle: VecDeque<IdleConnection<C>>,
    in_use: HashSet<ConnectionId>,
    /// Slots reserved for connections currently being created
    pending: usize,
    closed: bool,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }
}

enum Reservation<C> {
    Idle(IdleConnection<C>),
    Create,
}

struct PoolInner<C: Connection> {
    id: PoolId,
    config: ConnectionPoolConfig,
    factory: Box<dyn ConnectionFactory<C>>,
    state: Mutex<PoolState<C>>,
    available: Condvar,
    counters: PoolCounters,
}

impl<C: Connection> PoolInner<C> {
    fn acquire(
        self: &Arc<Self>,
        wait: Option<Duration>,
    ) -> Result<PooledConnection<C>, PoolError> {
        let deadline = wait.map(|timeout| (Instant::now() + timeout, timeout));
        loop {
            match self.reserve(deadline)? {
                Reservation::Idle(idle) => {
                    if idle.conn.is_valid() {
                        trace!("Reusing idle connection {}", idle.id);
                        return Ok(self.handle(idle.id, idle.conn));
                    }
                    debug!("Idle connection {} failed validation, closing", idle.id);
                    self.forget(&idle.id);
                    self.close_connection(idle.conn);
                }
                Reservation::Create => return self.create_reserved(),
            }
        }
    }

    /// Claim an idle connection or a creation slot, waiting for one until
    /// `deadline` if given.
    fn reserve(
        &self,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Reservation<C>, PoolError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(idle) = state.idle.pop_back() {
                state.in_use.insert(idle.id);
                return Ok(Reservation::Idle(idle));
            }
            if state.total() < self.config.max_size {
                state.pending += 1;
                return Ok(Reservation::Create);
            }

            let Some((deadline, timeout)) = deadline else {
                self.counters.exhausted.increment();
                return Err(PoolError::Exhausted {
                    max_size: self.config.max_size,
                });
            };
            if Instant::now() >= deadline {
                self.counters.exhausted.increment();
                return Err(PoolError::Timeout(timeout));
            }
            self.available.wait_until(&mut state, deadline);
        }
    }

    fn create_reserved(self: &Arc<Self>) -> Result<PooledConnection<C>, PoolError> {
        let created = self.factory.create();

        let mut state = self.state.lock();
        state.pending -= 1;
        match created {
            Ok(conn) if state.closed => {
                drop(state);
                debug!("Pool {} closed while creating a connection", self.id);
                self.close_connection(conn);
                Err(PoolError::Closed)
            }
            Ok(conn) => {
                let id = ConnectionId::new();
                state.in_use.insert(id);
                drop(state);
                self.counters.created.increment();
                trace!("Created connection {} for pool {}", id, self.id);
                Ok(self.handle(id, conn))
            }
            Err(e) => {
                drop(state);
                self.available.notify_one();
                Err(PoolError::CreationFailed(e))
            }
        }
    }

    fn handle(self: &Arc<Self>, id: ConnectionId, conn: C) -> PooledConnection<C> {
        PooledConnection {
            id,
            pool_id: self.id,
            conn: Some(conn),
            pool: Arc::downgrade(self),
            acquired_at: Instant::now(),
        }
    }

    fn release(&self, id: ConnectionId, conn: C) {
        let valid = conn.is_valid();
        let mut state = self.state.lock();
        let owned = state.in_use.remove(&id);

        if state.closed || !owned || !valid {
            drop(state);
            self.available.notify_one();
            if !owned {
                warn!("Connection {} is not checked out of pool {}", id, self.id);
            }
            self.close_connection(conn);
            return;
        }

        state.idle.push_back(IdleConnection {
            id,
            conn,
            idle_since: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    /// Free the slot of a checked-out connection without returning it.
    fn forget(&self, id: &ConnectionId) {
        self.state.lock().in_use.remove(id);
        self.available.notify_one();
    }

    fn close_connection(&self, mut conn: C) {
        if let Err(e) = conn.close() {
            warn!("Error closing connection in pool {}: {}", self.id, e);
        }
        self.counters.closed.increment();
    }

    fn evict_idle(&self) -> usize {
        let expired: Vec<IdleConnection<C>> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            while state.idle.len() > self.config.min_size {
                let oldest_expired = state
                    .idle
                    .front()
                    .is_some_and(|idle| idle.idle_since.elapsed() >= self.config.idle_timeout);
                if !oldest_expired {
                    break;
                }
                expired.extend(state.idle.pop_front());
            }
            expired
        };

        if expired.is_empty() {
            return 0;
        }
        self.available.notify_all();

        let count = expired.len();
        for idle in expired {
            trace!("Evicting idle connection {}", idle.id);
            self.close_connection(idle.conn);
        }
        self.counters.evicted.add(count);
        debug!("Evicted {} idle connections from pool {}", count, self.id);
        count
    }

    /// Mark the pool closed and take the idle connections. Returns `None` if
    /// the pool was already closed.
    fn shut(&self) -> Option<Vec<IdleConnection<C>>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        let idle = state.idle.drain(..).collect();
        drop(state);
        self.available.notify_all();
        Some(idle)
    }
}

/// A bounded pool of connections to an external service
pub struct ConnectionPool<C: Connection> {
    inner: Arc<PoolInner<C>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop_sweeper: Mutex<Option<Sender<()>>>,
}

impl<C: Connection> ConnectionPool<C> {
    /// Create a pool, pre-open `min_size` connections and start the idle
    /// sweeper.
    ///
    /// Failures while pre-opening are logged and skipped; the pool fills the
    /// gap lazily.
    pub fn new<F>(config: ConnectionPoolConfig, factory: F) -> Result<Self, PoolError>
    where
        F: ConnectionFactory<C>,
    {
        let config = config.normalized();
        let id = PoolId::new();
        info!(
            "Creating connection pool {} (min {}, max {})",
            id, config.min_size, config.max_size
        );

        let counters = PoolCounters::default();
        let mut idle = VecDeque::with_capacity(config.max_size);
        for _ in 0..config.min_size {
            match factory.create() {
                Ok(conn) => {
                    counters.created.increment();
                    idle.push_back(IdleConnection {
                        id: ConnectionId::new(),
                        conn,
                        idle_since: Instant::now(),
                    });
                }
                Err(e) => warn!("Failed to pre-create connection for pool {}: {}", id, e),
            }
        }

        let inner = Arc::new(PoolInner {
            id,
            config,
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle,
                in_use: HashSet::new(),
                pending: 0,
                closed: false,
            }),
            available: Condvar::new(),
            counters,
        });

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let weak = Arc::downgrade(&inner);
        let interval = inner.config.sweep_interval;
        let spawned = thread::Builder::new()
            .name("vigil-pool-sweeper".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => match weak.upgrade() {
                            Some(inner) => {
                                inner.evict_idle();
                            }
                            None => break,
                        },
                    }
                }
                trace!("Connection pool sweeper exiting");
            });

        let sweeper = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                for idle in inner.shut().unwrap_or_default() {
                    inner.close_connection(idle.conn);
                }
                return Err(PoolError::Spawn(e));
            }
        };

        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
            stop_sweeper: Mutex::new(Some(stop_tx)),
        })
    }

    /// Take a connection without waiting.
    ///
    /// Reuses the most recently returned idle connection, or opens a new one
    /// when below `max_size`. Fails with [`PoolError::Exhausted`] at capacity.
    pub fn get(&self) -> Result<PooledConnection<C>, PoolError> {
        self.inner.acquire(None)
    }

    /// Take a connection, waiting up to `timeout` for one to be returned.
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledConnection<C>, PoolError> {
        self.inner.acquire(Some(timeout))
    }

    /// Take a connection, waiting up to the configured `acquire_timeout`.
    pub fn get_default_timeout(&self) -> Result<PooledConnection<C>, PoolError> {
        self.get_timeout(self.inner.config.acquire_timeout)
    }

    /// Return a connection.
    ///
    /// Dropping the handle does the same. A handle that belongs to a
    /// different pool is discarded so it frees its slot in the pool that
    /// created it.
    pub fn put(&self, conn: PooledConnection<C>) {
        if conn.pool_id != self.inner.id {
            warn!(
                "Connection {} from pool {} returned to pool {}, discarding",
                conn.id, conn.pool_id, self.inner.id
            );
            conn.discard();
            return;
        }
        drop(conn);
    }

    /// Close idle connections past `idle_timeout`, keeping `min_size` idle.
    /// Returns how many were closed. The sweeper calls this periodically.
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_idle()
    }

    /// Close the pool and every idle connection. Checked-out connections are
    /// closed as they come back. Closing twice is a no-op.
    pub fn close(&self) {
        let Some(idle) = self.inner.shut() else {
            return;
        };

        self.stop_sweeper.lock().take();
        if let Some(handle) = self.sweeper.lock().take() {
            if handle.join().is_err() {
                warn!("Sweeper of pool {} panicked", self.inner.id);
            }
        }

        let count = idle.len();
        for idle in idle {
            self.inner.close_connection(idle.conn);
        }
        info!(
            "Connection pool {} closed ({} idle connections closed)",
            self.inner.id, count
        );
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of checked-out connections.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use.len()
    }

    /// Number of idle connections.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Idle plus checked-out plus being created.
    pub fn size(&self) -> usize {
        self.inner.state.lock().total()
    }

    /// Identifier of this pool.
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.inner.config
    }

    /// Current statistics.
    pub fn stats(&self) -> ConnectionPoolStats {
        let counters = &self.inner.counters;
        ConnectionPoolStats {
            created: counters.created.get(),
            closed: counters.closed.get(),
            evicted: counters.evicted.get(),
            exhausted: counters.exhausted.get(),
        }
    }
}

impl<C: Connection> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: Connection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("idle", &state.idle.len())
            .field("in_use", &state.in_use.len())
            .field("pending", &state.pending)
            .field("closed", &state.closed)
            .finish()
    }
}

/// A checked-out connection. Dropping it returns the connection to its pool.
pub struct PooledConnection<C: Connection> {
    id: ConnectionId,
    pool_id: PoolId,
    conn: Option<C>,
    pool: Weak<PoolInner<C>>,
    acquired_at: Instant,
}

impl<C: Connection> PooledConnection<C> {
    /// Identity of the underlying connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Pool the connection belongs to.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Time since the connection was checked out.
    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Close the connection instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            match self.pool.upgrade() {
                Some(pool) => {
                    pool.forget(&self.id);
                    pool.close_connection(conn);
                }
                None => {
                    let _ = conn.close();
                }
            }
        }
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("Connection missing")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("Connection missing")
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.release(self.id, conn),
                None => {
                    // Pool no longer exists
                    let _ = conn.close();
                }
            }
        }
    }
}

impl<C: Connection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .finish()
    }
}
