//! Fixed-size worker pool with bounded task, result and error queues.
//!
//! Tasks receive the pool's [`CancellationToken`]. Successful values go to
//! the result queue and failures to the error queue. Once the token fires,
//! queued tasks are discarded without running and outputs of tasks still in
//! progress are dropped. A consumer cannot tell a cancelled task from a lost
//! one without its own bookkeeping.

use crate::sync::{panic_message, AtomicCounter, AtomicFlag, AtomicMax, CancellationToken};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use vigil_core::config::WorkerPoolConfig;
use vigil_core::error::WorkerError;

/// A unit of work for a [`WorkerPool`].
pub type Task<T, E> = Box<dyn FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static>;

/// Statistics about the worker pool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Number of tasks accepted
    pub tasks_queued: usize,

    /// Number of tasks that returned `Ok`
    pub tasks_completed: usize,

    /// Number of tasks that returned `Err`
    pub tasks_failed: usize,

    /// Number of tasks that panicked
    pub tasks_panicked: usize,

    /// Tasks skipped or outputs dropped because of cancellation
    pub tasks_discarded: usize,

    /// Total task execution time (microseconds)
    pub total_execution_time_us: u64,

    /// Total time tasks spent queued (microseconds)
    pub total_queue_time_us: u64,

    /// Maximum task execution time (microseconds)
    pub max_execution_time_us: u64,
}

/// Task with metadata for tracking
struct Job<T, E> {
    func: Task<T, E>,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    queued: AtomicCounter,
    completed: AtomicCounter,
    failed: AtomicCounter,
    panicked: AtomicCounter,
    discarded: AtomicCounter,
    total_execution_time_us: AtomicCounter,
    total_queue_time_us: AtomicCounter,
    max_execution_time_us: AtomicMax,
}

#[derive(Debug, Default)]
struct Shared {
    token: CancellationToken,
    in_flight: AtomicCounter,
    closed: AtomicFlag,
    counters: WorkerCounters,
}

/// How long an enqueue may block on a full queue
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    Never,
    Forever,
    Timeout(Duration),
}

/// Why an enqueue was refused
#[derive(Debug)]
pub(crate) enum Rejected {
    Full,
    Closed,
    TimedOut(Duration),
}

/// A fixed set of executor threads fed by a bounded task queue
pub struct WorkerPool<T, E> {
    input: Mutex<Option<Sender<Job<T, E>>>>,
    results: Receiver<T>,
    errors: Receiver<E>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
    config: WorkerPoolConfig,
}

impl<T, E> WorkerPool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a pool with `workers` threads and default queue sizes.
    pub fn with_workers(workers: usize) -> Result<Self, WorkerError> {
        Self::new(WorkerPoolConfig {
            workers,
            ..Default::default()
        })
    }

    /// Create a pool and start its executor threads.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, WorkerError> {
        let config = config.normalized();
        let (input_tx, input_rx) = bounded::<Job<T, E>>(config.queue_size);
        let (result_tx, results) = bounded(config.result_buffer);
        let (error_tx, errors) = bounded(config.error_buffer);
        let shared = Arc::new(Shared::default());

        info!(
            "Creating worker pool with {} workers and queue size {}",
            config.workers, config.queue_size
        );

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let rx = input_rx.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            let shared_clone = Arc::clone(&shared);

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || worker_loop(index, rx, result_tx, error_tx, shared_clone));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", index, e);
                    shared.token.cancel();
                    drop(input_tx);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::Spawn(e));
                }
            }
        }

        Ok(Self {
            input: Mutex::new(Some(input_tx)),
            results,
            errors,
            workers: Mutex::new(workers),
            shared,
            config,
        })
    }

    /// Queue a task without blocking.
    ///
    /// Fails with [`WorkerError::QueueFull`] when the queue is at capacity
    /// and [`WorkerError::Closed`] once the pool is shutting down.
    pub fn submit<F>(&self, f: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        self.enqueue(Box::new(f), Wait::Never)
            .map_err(Rejected::into_worker_error)
    }

    /// Queue a task, waiting for space. Fails with [`WorkerError::Closed`] if
    /// the pool is cancelled while waiting.
    pub fn submit_blocking<F>(&self, f: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        self.enqueue(Box::new(f), Wait::Forever)
            .map_err(Rejected::into_worker_error)
    }

    /// Queue a task, waiting up to `timeout` for space. A queue that stays
    /// full is reported as [`WorkerError::QueueFull`].
    pub fn submit_timeout<F>(&self, f: F, timeout: Duration) -> Result<(), WorkerError>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    {
        self.enqueue(Box::new(f), Wait::Timeout(timeout))
            .map_err(Rejected::into_worker_error)
    }

    pub(crate) fn enqueue(&self, func: Task<T, E>, wait: Wait) -> Result<(), Rejected> {
        let token = &self.shared.token;
        if token.is_cancelled() {
            return Err(Rejected::Closed);
        }
        let Some(tx) = self.input.lock().clone() else {
            return Err(Rejected::Closed);
        };

        let job = Job {
            func,
            enqueued_at: Instant::now(),
        };

        // Incremented before the send; the worker decrements
        self.shared.in_flight.increment();
        let sent = match wait {
            Wait::Never => match tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(Rejected::Full),
                Err(TrySendError::Disconnected(_)) => Err(Rejected::Closed),
            },
            Wait::Forever => select! {
                send(tx, job) -> res => res.map_err(|_| Rejected::Closed),
                recv(token.cancelled()) -> _ => Err(Rejected::Closed),
            },
            Wait::Timeout(timeout) => select! {
                send(tx, job) -> res => res.map_err(|_| Rejected::Closed),
                recv(token.cancelled()) -> _ => Err(Rejected::Closed),
                default(timeout) => Err(Rejected::TimedOut(timeout)),
            },
        };

        match sent {
            Ok(()) => {
                self.shared.counters.queued.increment();
                Ok(())
            }
            Err(rejected) => {
                self.shared.in_flight.decrement();
                Err(rejected)
            }
        }
    }

    /// Receiver for successful task outputs. Closes after [`close`](Self::close).
    pub fn results(&self) -> Receiver<T> {
        self.results.clone()
    }

    /// Receiver for task errors. Closes after [`close`](Self::close).
    pub fn errors(&self) -> Receiver<E> {
        self.errors.clone()
    }

    /// Tasks accepted whose output has not yet been routed or discarded.
    pub fn pending(&self) -> usize {
        self.shared.in_flight.get()
    }

    /// Number of executor threads.
    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// The token handed to every task.
    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Current statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let counters = &self.shared.counters;
        WorkerPoolStats {
            tasks_queued: counters.queued.get(),
            tasks_completed: counters.completed.get(),
            tasks_failed: counters.failed.get(),
            tasks_panicked: counters.panicked.get(),
            tasks_discarded: counters.discarded.get(),
            total_execution_time_us: counters.total_execution_time_us.get() as u64,
            total_queue_time_us: counters.total_queue_time_us.get() as u64,
            max_execution_time_us: counters.max_execution_time_us.get(),
        }
    }

    /// Cancel, close the task queue and wait for every executor to exit.
    ///
    /// Queued tasks are discarded without running. Afterwards the result and
    /// error receivers yield whatever was buffered and then disconnect.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if !self.shared.closed.try_set() {
            return;
        }
        info!("Shutting down worker pool");
        self.shared.token.cancel();
        self.input.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        info!("Worker pool shutdown complete");
    }
}

impl<T, E> Drop for WorkerPool<T, E> {
    fn drop(&mut self) {
        // Workers may hold the last reference, so don't join here
        self.shared.token.cancel();
        self.input.lock().take();
        debug!("Worker pool dropped, workers exit once the queue drains");
    }
}

impl<T, E> fmt::Debug for WorkerPool<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.config.workers)
            .field("pending", &self.shared.in_flight.get())
            .field("closed", &self.shared.token.is_cancelled())
            .finish()
    }
}

impl Rejected {
    fn into_worker_error(self) -> WorkerError {
        match self {
            Rejected::Full | Rejected::TimedOut(_) => WorkerError::QueueFull,
            Rejected::Closed => WorkerError::Closed,
        }
    }
}

fn worker_loop<T, E>(
    index: usize,
    rx: Receiver<Job<T, E>>,
    results: Sender<T>,
    errors: Sender<E>,
    shared: Arc<Shared>,
) {
    debug!("Worker {}: starting", index);
    let counters = &shared.counters;
    let token = &shared.token;

    // Runs until the queue is closed and drained
    for job in rx.iter() {
        if token.is_cancelled() {
            counters.discarded.increment();
            shared.in_flight.decrement();
            continue;
        }

        let queue_time = job.enqueued_at.elapsed();
        counters
            .total_queue_time_us
            .add(queue_time.as_micros() as usize);

        let exec_start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (job.func)(token)));
        let exec_time = exec_start.elapsed();

        counters
            .total_execution_time_us
            .add(exec_time.as_micros() as usize);
        counters
            .max_execution_time_us
            .observe(exec_time.as_micros() as u64);
        shared.in_flight.decrement();

        let routed = match outcome {
            Ok(Ok(value)) => {
                counters.completed.increment();
                trace!(
                    "Worker {}: task completed in {:.2}ms",
                    index,
                    exec_time.as_micros() as f64 / 1000.0
                );
                token.send(&results, value)
            }
            Ok(Err(e)) => {
                counters.failed.increment();
                token.send(&errors, e)
            }
            Err(payload) => {
                counters.panicked.increment();
                error!(
                    "Worker {}: task panicked: {}",
                    index,
                    panic_message(payload.as_ref())
                );
                true
            }
        };
        if !routed {
            counters.discarded.increment();
        }
    }

    debug!("Worker {}: shutting down", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn small_pool(workers: usize, queue_size: usize) -> WorkerPool<usize, String> {
        WorkerPool::new(WorkerPoolConfig {
            workers,
            queue_size,
            thread_name_prefix: "test-worker".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_routes_values_and_errors() {
        let pool = small_pool(2, 16);
        for i in 0..10usize {
            pool.submit(move |_| if i % 2 == 0 { Ok(i) } else { Err(format!("odd {}", i)) })
                .unwrap();
        }
        let results = pool.results();
        let errors = pool.errors();
        let timeout = Duration::from_secs(5);

        let mut values: Vec<usize> = (0..5)
            .map(|_| results.recv_timeout(timeout).unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
        for _ in 0..5 {
            assert!(errors.recv_timeout(timeout).unwrap().starts_with("odd"));
        }

        pool.close();
        // Both queues disconnect once the workers have exited
        assert!(results.recv().is_err());
        assert!(errors.recv().is_err());
    }

    #[test]
    fn test_queue_full() {
        let pool = small_pool(1, 1);
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.submit(move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(0)
        })
        .unwrap();
        started_rx.recv().unwrap();

        // Fill the queue
        pool.submit(|_| Ok(1)).unwrap();

        let err = pool.submit(|_| Ok(2)).unwrap_err();
        assert!(matches!(err, WorkerError::QueueFull));
        assert!(err.is_retryable());
        assert_eq!(pool.pending(), 2);

        let err = pool
            .submit_timeout(|_| Ok(3), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, WorkerError::QueueFull));

        drop(release_tx);
        let mut values: Vec<usize> = pool.results().iter().take(2).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1]);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_submit_blocking_waits_for_space() {
        let pool = Arc::new(small_pool(1, 1));
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.submit(move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(0)
        })
        .unwrap();
        started_rx.recv().unwrap();
        pool.submit(|_| Ok(1)).unwrap();

        let submitter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.submit_blocking(|_| Ok(2)))
        };
        thread::sleep(Duration::from_millis(20));
        drop(release_tx);

        assert!(submitter.join().unwrap().is_ok());
        let mut values: Vec<usize> = pool.results().iter().take(3).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn test_submit_blocking_gives_up_on_cancel() {
        let pool = Arc::new(small_pool(1, 1));
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.submit(move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(0)
        })
        .unwrap();
        started_rx.recv().unwrap();
        pool.submit(|_| Ok(1)).unwrap();

        let submitter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.submit_blocking(|_| Ok(2)))
        };
        thread::sleep(Duration::from_millis(20));

        // The queue stays full, so only cancellation can wake the submitter
        pool.token().cancel();
        assert!(matches!(submitter.join().unwrap(), Err(WorkerError::Closed)));

        drop(release_tx);
        pool.close();
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.stats().tasks_discarded, 2);
    }

    #[test]
    fn test_panic_is_contained() {
        let pool = small_pool(1, 4);
        let ran = Arc::new(AtomicBool::new(false));

        pool.submit(|_| panic!("task exploded")).unwrap();
        let flag = Arc::clone(&ran);
        pool.submit(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        })
        .unwrap();

        assert_eq!(pool.results().recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert!(ran.load(Ordering::SeqCst));

        pool.close();
        let stats = pool.stats();
        assert_eq!(stats.tasks_panicked, 1);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_queued, 2);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_close_discards_queued_tasks() {
        let pool = small_pool(1, 8);
        let runs = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.submit(move |token| {
            started_tx.send(()).unwrap();
            token.wait_timeout(Duration::from_secs(10));
            Ok(0)
        })
        .unwrap();
        started_rx.recv().unwrap();

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            pool.submit(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .unwrap();
        }

        let results = pool.results();
        pool.close();
        pool.close();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // Output produced after cancellation is dropped
        assert_eq!(results.iter().count(), 0);
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.stats().tasks_discarded, 4);
        assert!(matches!(pool.submit(|_| Ok(9)), Err(WorkerError::Closed)));
    }

    #[test]
    fn test_zero_workers_clamped() {
        let pool: WorkerPool<(), ()> = WorkerPool::with_workers(0).unwrap();
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_stats() {
        let pool = small_pool(1, 8);
        for _ in 0..3 {
            pool.submit(|_| {
                thread::sleep(Duration::from_millis(5));
                Ok(1)
            })
            .unwrap();
        }
        let results = pool.results();
        for _ in 0..3 {
            results.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.close();

        let stats = pool.stats();
        assert_eq!(stats.tasks_queued, 3);
        assert_eq!(stats.tasks_completed, 3);
        assert!(stats.total_execution_time_us >= 15_000);
        assert!(stats.max_execution_time_us >= 5_000);
    }
}
