//! Request coalescing: collect items into batches and run one batch call
//! for all of them.
//!
//! A batch is flushed by whichever comes first: it reaches
//! `max_batch_size`, `max_wait_time` passes after its first item, someone
//! calls [`BatchProcessor::flush`], or the processor is closed. The open
//! batch is swapped out under the lock, so new submissions immediately fill
//! a fresh batch while the old one is processed on a background thread.

use super::promise::{self, PromiseResolver, ResultPromise};
use crate::sync::{panic_message, AtomicCounter, CancellationToken};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vigil_core::config::BatchConfig;
use vigil_core::error::{BatchError, BoxError};

type BatchFn<T, R> =
    Arc<dyn Fn(&CancellationToken, Vec<T>) -> Vec<Result<R, BoxError>> + Send + Sync>;

/// Statistics about a batch processor
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchStats {
    /// Batches handed to the batch function
    pub batches_flushed: usize,

    /// Items across all flushed batches
    pub items_flushed: usize,

    /// Flushes caused by reaching `max_batch_size`
    pub size_triggered: usize,

    /// Flushes caused by `max_wait_time` expiring
    pub timer_triggered: usize,

    /// Flushes requested through `flush`
    pub manual_triggered: usize,

    /// Flushes of the partial batch left at `close`
    pub close_triggered: usize,

    /// Items resolved with `BatchError::Incomplete`
    pub incomplete_results: usize,

    /// Batch function calls that panicked
    pub panics: usize,
}

#[derive(Debug, Default)]
struct BatchCounters {
    batches_flushed: AtomicCounter,
    items_flushed: AtomicCounter,
    size_triggered: AtomicCounter,
    timer_triggered: AtomicCounter,
    manual_triggered: AtomicCounter,
    close_triggered: AtomicCounter,
    incomplete_results: AtomicCounter,
    panics: AtomicCounter,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Size,
    Timer,
    Manual,
    Close,
}

/// The batch currently accepting items
struct OpenBatch<T, R> {
    items: Vec<T>,
    resolvers: Vec<PromiseResolver<R>>,
    generation: u64,
    /// Dropping this stops the wait-time timer of the current batch
    timer: Option<Sender<()>>,
    closed: bool,
}

/// A batch swapped out for processing
struct Batch<T, R> {
    items: Vec<T>,
    resolvers: Vec<PromiseResolver<R>>,
}

impl<T, R> OpenBatch<T, R> {
    fn take(&mut self) -> Option<Batch<T, R>> {
        if self.items.is_empty() {
            return None;
        }
        self.generation += 1;
        self.timer = None;
        Some(Batch {
            items: mem::take(&mut self.items),
            resolvers: mem::take(&mut self.resolvers),
        })
    }
}

struct Shared<T, R> {
    config: BatchConfig,
    batch_fn: BatchFn<T, R>,
    state: Mutex<OpenBatch<T, R>>,
    token: CancellationToken,
    active: Mutex<usize>,
    idle: Condvar,
    counters: BatchCounters,
}

impl<T, R> Shared<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn start_timer(self: &Arc<Self>, stop: Receiver<()>, generation: u64) {
        let shared = Arc::clone(self);
        let wait = self.config.max_wait_time;
        let spawned = thread::Builder::new()
            .name("vigil-batch-timer".to_string())
            .spawn(move || {
                select! {
                    recv(stop) -> _ => {}
                    recv(shared.token.cancelled()) -> _ => {}
                    recv(after(wait)) -> _ => shared.flush_generation(generation),
                }
            });

        if let Err(e) = spawned {
            error!("Failed to spawn batch timer, flushing now: {}", e);
            self.flush_generation(generation);
        }
    }

    /// Timer expiry: flush only if the batch the timer belongs to is still open.
    fn flush_generation(self: &Arc<Self>, generation: u64) {
        let batch = {
            let mut state = self.state.lock();
            if state.generation != generation {
                trace!("Stale batch timer for generation {}", generation);
                return;
            }
            state.take()
        };
        if let Some(batch) = batch {
            self.dispatch(batch, Trigger::Timer, self.token.clone());
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        batch: Batch<T, R>,
        trigger: Trigger,
        token: CancellationToken,
    ) {
        let counter = match trigger {
            Trigger::Size => &self.counters.size_triggered,
            Trigger::Timer => &self.counters.timer_triggered,
            Trigger::Manual => &self.counters.manual_triggered,
            Trigger::Close => &self.counters.close_triggered,
        };
        counter.increment();

        *self.active.lock() += 1;
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("vigil-batch-flush".to_string())
            .spawn(move || {
                shared.run(batch, trigger, &token);
                shared.finish_flush();
            });

        // The batch went down with the closure; its resolvers abandon
        // every promise.
        if let Err(e) = spawned {
            error!("Failed to spawn batch flush thread: {}", e);
            self.finish_flush();
        }
    }

    fn run(&self, batch: Batch<T, R>, trigger: Trigger, token: &CancellationToken) {
        let Batch { items, resolvers } = batch;
        let size = items.len();
        debug!("Flushing batch of {} items ({:?})", size, trigger);

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.batch_fn)(token, items)));
        self.counters.batches_flushed.increment();
        self.counters.items_flushed.add(size);

        let results = match outcome {
            Ok(results) => results,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Batch function panicked on {} items: {}", size, message);
                self.counters.panics.increment();
                for resolver in resolvers {
                    resolver.resolve(Err(BatchError::Panicked(message.clone())));
                }
                return;
            }
        };

        let returned = results.len();
        if returned > size {
            warn!(
                "Batch function returned {} results for {} items, ignoring the surplus",
                returned, size
            );
        } else if returned < size {
            warn!(
                "Batch function returned {} results for {} items",
                returned, size
            );
            self.counters.incomplete_results.add(size - returned);
        }

        let mut results = results.into_iter();
        for (index, resolver) in resolvers.into_iter().enumerate() {
            let result = match results.next() {
                Some(Ok(value)) => Ok(value),
                Some(Err(e)) => Err(BatchError::failed(e)),
                None => Err(BatchError::Incomplete { index, returned }),
            };
            resolver.resolve(result);
        }

        trace!(
            "Batch of {} items resolved in {:.2}ms",
            size,
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }

    fn finish_flush(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.idle.notify_all();
        }
    }
}

/// Coalesces individual submissions into batch calls.
///
/// `batch_fn` receives the items of one batch in submission order and must
/// return results index-aligned with them. Missing results resolve the
/// remaining promises with [`BatchError::Incomplete`]; extra results are
/// ignored.
///
/// # Examples
///
/// ```
/// use vigil_concurrency::batch::BatchProcessor;
/// use vigil_concurrency::sync::CancellationToken;
/// use vigil_core::config::BatchConfig;
///
/// let processor = BatchProcessor::new(
///     BatchConfig { max_batch_size: 3, ..Default::default() },
///     |_token, items: Vec<u64>| items.into_iter().map(|x| Ok(x * 2)).collect(),
/// );
///
/// let ctx = CancellationToken::new();
/// let promises: Vec<_> = (1..=3)
///     .map(|x| processor.process(&ctx, x).unwrap())
///     .collect();
/// let results: Vec<u64> = promises.iter().map(|p| p.wait().unwrap()).collect();
/// assert_eq!(results, vec![2, 4, 6]);
/// ```
pub struct BatchProcessor<T: Send + 'static, R: Send + 'static> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> BatchProcessor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create a processor. No threads run until the first item arrives.
    pub fn new<F>(config: BatchConfig, batch_fn: F) -> Self
    where
        F: Fn(&CancellationToken, Vec<T>) -> Vec<Result<R, BoxError>> + Send + Sync + 'static,
    {
        let config = config.normalized();
        info!(
            "Creating batch processor (max batch size {}, max wait {:?})",
            config.max_batch_size, config.max_wait_time
        );
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(OpenBatch {
                    items: Vec::with_capacity(config.max_batch_size),
                    resolvers: Vec::with_capacity(config.max_batch_size),
                    generation: 0,
                    timer: None,
                    closed: false,
                }),
                config,
                batch_fn: Arc::new(batch_fn),
                token: CancellationToken::new(),
                active: Mutex::new(0),
                idle: Condvar::new(),
                counters: BatchCounters::default(),
            }),
        }
    }

    /// Add `item` to the open batch and return a promise for its result.
    ///
    /// Never blocks on processing. Fails with [`BatchError::Cancelled`] if
    /// `ctx` has fired and [`BatchError::ProcessorClosed`] after `close`.
    pub fn process(
        &self,
        ctx: &CancellationToken,
        item: T,
    ) -> Result<ResultPromise<R>, BatchError> {
        if ctx.is_cancelled() {
            return Err(BatchError::Cancelled);
        }

        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.closed {
            return Err(BatchError::ProcessorClosed);
        }

        let (resolver, promise) = promise::pair();
        state.items.push(item);
        state.resolvers.push(resolver);

        let len = state.items.len();
        let max = shared.config.max_batch_size;
        let timer = if len == 1 && max > 1 {
            let (stop_tx, stop_rx) = bounded::<()>(0);
            state.timer = Some(stop_tx);
            Some((stop_rx, state.generation))
        } else {
            None
        };
        let full = if len >= max { state.take() } else { None };
        drop(state);

        if let Some(batch) = full {
            shared.dispatch(batch, Trigger::Size, shared.token.clone());
        } else if let Some((stop, generation)) = timer {
            shared.start_timer(stop, generation);
        }
        Ok(promise)
    }

    /// Flush the open batch now. Returns the number of items dispatched.
    pub fn flush(&self) -> usize {
        let batch = self.shared.state.lock().take();
        match batch {
            Some(batch) => {
                let size = batch.items.len();
                self.shared
                    .dispatch(batch, Trigger::Manual, self.shared.token.clone());
                size
            }
            None => 0,
        }
    }

    /// Items waiting in the open batch.
    pub fn pending_items(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Batches currently being processed.
    pub fn active_flushes(&self) -> usize {
        *self.shared.active.lock()
    }

    /// Wait until no batch is being processed. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.shared.active.lock();
        while *active > 0 {
            if self.shared.idle.wait_until(&mut active, deadline).timed_out() {
                break;
            }
        }
        *active == 0
    }

    /// Stop accepting items and flush the open batch.
    ///
    /// The processor token fires, stopping timers and signalling batch
    /// functions in progress. The final partial batch is processed in the
    /// background with a fresh token so its promises get real results.
    /// Does not wait; see [`close_and_wait`](Self::close_and_wait). Closing
    /// twice is a no-op.
    pub fn close(&self) {
        let batch = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.take()
        };
        self.shared.token.cancel();

        let size = batch.as_ref().map_or(0, |batch| batch.items.len());
        if let Some(batch) = batch {
            self.shared
                .dispatch(batch, Trigger::Close, CancellationToken::new());
        }
        info!("Batch processor closed ({} items in final batch)", size);
    }

    /// [`close`](Self::close), then wait up to `timeout` for in-progress
    /// batches. Returns false on timeout.
    pub fn close_and_wait(&self, timeout: Duration) -> bool {
        self.close();
        self.wait_idle(timeout)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Current statistics.
    pub fn stats(&self) -> BatchStats {
        let counters = &self.shared.counters;
        BatchStats {
            batches_flushed: counters.batches_flushed.get(),
            items_flushed: counters.items_flushed.get(),
            size_triggered: counters.size_triggered.get(),
            timer_triggered: counters.timer_triggered.get(),
            manual_triggered: counters.manual_triggered.get(),
            close_triggered: counters.close_triggered.get(),
            incomplete_results: counters.incomplete_results.get(),
            panics: counters.panics.get(),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Drop for BatchProcessor<T, R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Send + 'static, R: Send + 'static> fmt::Debug for BatchProcessor<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BatchProcessor")
            .field("pending_items", &state.items.len())
            .field("generation", &state.generation)
            .field("closed", &state.closed)
            .finish()
    }
}
