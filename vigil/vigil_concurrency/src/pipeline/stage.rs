//! A single transform stage: bounded input, parallel workers, bounded
//! result and error outputs.

use crate::pool::worker::{Rejected, Wait, WorkerPool};
use crate::sync::CancellationToken;
use crossbeam_channel::Receiver;
use log::info;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use vigil_core::config::{PipelineConfig, WorkerPoolConfig};
use vigil_core::error::{PipelineError, WorkerError};

type Transform<T, R, E> = Arc<dyn Fn(&CancellationToken, T) -> Result<R, E> + Send + Sync>;

/// Statistics about a pipeline
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Items accepted by `submit`
    pub submitted: usize,

    /// Items transformed into a result
    pub completed: usize,

    /// Items whose transform returned an error
    pub failed: usize,

    /// Items whose transform panicked (no output)
    pub panicked: usize,

    /// Items skipped or outputs dropped because of cancellation
    pub discarded: usize,
}

/// Fan-out stage applying `transform` to every submitted item on
/// `workers` threads.
///
/// Results arrive in completion order, not submission order.
pub struct Pipeline<T, R, E> {
    pool: WorkerPool<R, E>,
    transform: Transform<T, R, E>,
    config: PipelineConfig,
}

impl<T, R, E> Pipeline<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Start the workers. `transform` receives the pipeline's token and
    /// should return early once it fires.
    pub fn new<F>(config: PipelineConfig, transform: F) -> Result<Self, PipelineError>
    where
        F: Fn(&CancellationToken, T) -> Result<R, E> + Send + Sync + 'static,
    {
        let config = config.normalized();
        info!(
            "Creating pipeline with {} workers (input {}, output {}, errors {})",
            config.workers, config.input_buffer, config.output_buffer, config.error_buffer
        );

        let pool = WorkerPool::new(WorkerPoolConfig {
            workers: config.workers,
            queue_size: config.input_buffer,
            result_buffer: config.output_buffer,
            error_buffer: config.error_buffer,
            thread_name_prefix: config.thread_name_prefix.clone(),
        })
        .map_err(|e| match e {
            WorkerError::Spawn(e) => PipelineError::Spawn(e),
            WorkerError::QueueFull => PipelineError::QueueFull,
            WorkerError::Closed => PipelineError::Closed,
        })?;

        Ok(Self {
            pool,
            transform: Arc::new(transform),
            config,
        })
    }

    /// Submit an item, blocking while the input queue is full.
    ///
    /// Fails with [`PipelineError::Closed`] if the pipeline is cancelled
    /// before or while waiting.
    pub fn submit(&self, item: T) -> Result<(), PipelineError> {
        self.enqueue(item, Wait::Forever)
    }

    /// Submit an item without blocking; [`PipelineError::QueueFull`] when
    /// the input queue is at capacity.
    pub fn try_submit(&self, item: T) -> Result<(), PipelineError> {
        self.enqueue(item, Wait::Never)
    }

    /// Submit an item, waiting up to `timeout` for input capacity.
    pub fn submit_timeout(&self, item: T, timeout: Duration) -> Result<(), PipelineError> {
        self.enqueue(item, Wait::Timeout(timeout))
    }

    fn enqueue(&self, item: T, wait: Wait) -> Result<(), PipelineError> {
        let transform = Arc::clone(&self.transform);
        let task = Box::new(move |token: &CancellationToken| transform(token, item));
        self.pool
            .enqueue(task, wait)
            .map_err(|rejected| match rejected {
                Rejected::Full => PipelineError::QueueFull,
                Rejected::Closed => PipelineError::Closed,
                Rejected::TimedOut(timeout) => PipelineError::Timeout(timeout),
            })
    }

    /// Receiver for transformed items. Disconnects after [`close`](Self::close).
    pub fn results(&self) -> Receiver<R> {
        self.pool.results()
    }

    /// Receiver for transform errors. Disconnects after [`close`](Self::close).
    pub fn errors(&self) -> Receiver<E> {
        self.pool.errors()
    }

    /// Submitted items not yet routed to an output or discarded.
    pub fn processing_count(&self) -> usize {
        self.pool.pending()
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// The token handed to every transform call.
    pub fn token(&self) -> &CancellationToken {
        self.pool.token()
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current statistics.
    pub fn stats(&self) -> PipelineStats {
        let stats = self.pool.stats();
        PipelineStats {
            submitted: stats.tasks_queued,
            completed: stats.tasks_completed,
            failed: stats.tasks_failed,
            panicked: stats.tasks_panicked,
            discarded: stats.tasks_discarded,
        }
    }

    /// Cancel, stop accepting input and wait for every worker to exit.
    /// Output queues then disconnect. Closing twice is a no-op.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl<T, R, E> fmt::Debug for Pipeline<T, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("workers", &self.config.workers)
            .field("pool", &self.pool)
            .finish()
    }
}
