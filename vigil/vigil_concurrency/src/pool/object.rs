//! Generic object pooling for reusable scratch values.
//!
//! A [`Pool`] keeps idle instances of `T` (buffers, maps, encoders) so hot
//! paths can reuse allocations. Instances are created lazily when the idle
//! store is empty and scrubbed by the reset function on the way back in.
//!
//! `get` moves the instance out of the store, so an instance is either idle
//! or owned by exactly one caller. Callers may simply drop an instance
//! instead of returning it; the pool never learns about it again.

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Statistics about an object pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances built by the create function
    pub created: usize,

    /// `get` calls served from the idle store
    pub reused: usize,

    /// Instances accepted back into the idle store
    pub returned: usize,

    /// Returned instances dropped because the pool was full or closed
    pub discarded: usize,
}

struct PoolState<T> {
    idle: Vec<T>,
    closed: bool,
    stats: PoolStats,
}

/// A pool of reusable values
pub struct Pool<T> {
    state: Mutex<PoolState<T>>,
    create: CreateFn<T>,
    reset: Option<ResetFn<T>>,
    max_idle: Option<usize>,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool whose instances are built by `create` and returned as-is.
    pub fn new<F>(create: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                closed: false,
                stats: PoolStats::default(),
            }),
            create: Box::new(create),
            reset: None,
            max_idle: None,
        }
    }

    /// Create a pool that runs `reset` on every instance returned by `put`.
    pub fn with_reset<F, R>(create: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let mut pool = Self::new(create);
        pool.reset = Some(Box::new(reset));
        pool
    }

    /// Keep at most `max_idle` instances; further returns are dropped.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Take an instance, creating one if the idle store is empty. Never fails.
    pub fn get(&self) -> T {
        let mut state = self.state.lock();
        if let Some(value) = state.idle.pop() {
            state.stats.reused += 1;
            return value;
        }
        state.stats.created += 1;
        drop(state);

        trace!("Object pool empty, creating instance");
        (self.create)()
    }

    /// Return an instance. The reset function runs before it becomes
    /// available again; after `close` the instance is dropped instead.
    pub fn put(&self, mut value: T) {
        {
            let mut state = self.state.lock();
            if state.closed {
                state.stats.discarded += 1;
                return;
            }
        }

        // Reset runs outside the lock
        if let Some(reset) = &self.reset {
            reset(&mut value);
        }

        let mut state = self.state.lock();
        let full = self.max_idle.is_some_and(|max| state.idle.len() >= max);
        if state.closed || full {
            trace!("Discarding returned instance (closed: {})", state.closed);
            state.stats.discarded += 1;
            return;
        }
        state.stats.returned += 1;
        state.idle.push(value);
    }

    /// Take an instance wrapped in a guard that returns it on drop.
    pub fn checkout(self: &Arc<Self>) -> Pooled<T> {
        Pooled {
            value: Some(self.get()),
            pool: Arc::clone(self),
        }
    }

    /// Drop every idle instance. Later `put` calls discard their instance;
    /// `get` keeps working and simply creates. Closing twice is a no-op.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        debug!("Object pool closed, dropping {} idle instances", idle.len());
    }

    /// Number of idle instances.
    pub fn available_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats.clone()
    }
}

impl<V: Send + 'static> Pool<Vec<V>> {
    /// A pool of vectors that are truncated to zero length on return while
    /// keeping their capacity.
    pub fn vec_pool(capacity: usize) -> Self {
        Self::with_reset(move || Vec::with_capacity(capacity), Vec::clear)
    }
}

impl<K, V> Pool<HashMap<K, V>>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// A pool of maps whose keys are cleared on return.
    pub fn map_pool() -> Self {
        Self::with_reset(HashMap::new, HashMap::clear)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pool")
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .field("stats", &state.stats)
            .finish()
    }
}

/// A checked-out instance that goes back to its pool when dropped
pub struct Pooled<T: Send + 'static> {
    value: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Send + 'static> Pooled<T> {
    /// Keep the instance; the pool will not see it again.
    pub fn detach(mut self) -> T {
        self.value.take().expect("Pooled value missing")
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("Pooled value missing")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("Pooled value missing")
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "Pooled({:?})", value),
            None => write!(f, "Pooled(detached)"),
        }
    }
}
