//! Error types for the Vigil concurrency core.
//!
//! Each primitive has its own error enum so callers can match on exactly
//! the failures that primitive can produce. The root `Error` type wraps all
//! of them for code that just wants to propagate with `?`.
//!
//! Acquisition and submission errors are returned synchronously. Errors
//! produced by user-supplied processing functions never pass through these
//! types except inside [`BatchError::Failed`], where they are shared so a
//! resolved promise can be observed more than once.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used at the collaborator boundary (connection factories,
/// connection close, batch functions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Root error type for the Vigil core.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource and connection pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Worker pool errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Batch processor errors
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot up to `max_size` is idle-less and checked out or being created
    #[error("connection pool exhausted (max size {max_size})")]
    Exhausted {
        /// Configured maximum number of connections
        max_size: usize,
    },

    /// The pool has been closed
    #[error("connection pool is closed")]
    Closed,

    /// No connection became available within the acquisition timeout
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// The connection factory failed
    #[error("failed to create connection: {0}")]
    CreationFailed(#[source] BoxError),

    /// A background thread could not be spawned
    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl PoolError {
    /// Whether retrying after a backoff can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Timeout(_))
    }
}

/// Errors returned by the worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The task queue is at capacity
    #[error("worker queue is full")]
    QueueFull,

    /// The worker pool is shutting down or closed
    #[error("worker pool is closed")]
    Closed,

    /// An executor thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl WorkerError {
    /// Whether the caller should retry or shed load rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }
}

/// Errors returned by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input queue is at capacity (non-blocking submission only)
    #[error("pipeline input queue is full")]
    QueueFull,

    /// The pipeline has been cancelled or closed
    #[error("pipeline is closed")]
    Closed,

    /// The input queue stayed full for the whole timeout
    #[error("timed out after {0:?} waiting for pipeline capacity")]
    Timeout(Duration),

    /// A pipeline worker thread could not be spawned
    #[error("failed to spawn pipeline worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl PipelineError {
    /// Whether the submission can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::Timeout(_))
    }
}

/// Errors delivered through batch processor promises or returned by
/// `BatchProcessor::process`.
///
/// This type is `Clone` so that a resolved promise can hand out its result
/// any number of times.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// The batch function returned fewer results than it was given items
    #[error("batch function returned {returned} results, none for item {index}")]
    Incomplete {
        /// Position of the unmatched item within its batch
        index: usize,
        /// Number of results the batch function actually returned
        returned: usize,
    },

    /// The processor was closed before the item was accepted
    #[error("batch processor is closed")]
    ProcessorClosed,

    /// The caller's cancellation token had already fired
    #[error("submission cancelled")]
    Cancelled,

    /// The promise was still pending when the wait timed out
    #[error("timed out after {0:?} waiting for batch result")]
    Timeout(Duration),

    /// The batch function reported an error for this item
    #[error("batch item failed: {0}")]
    Failed(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The batch function panicked; every item of the batch gets this error
    #[error("batch function panicked: {0}")]
    Panicked(String),

    /// The promise's resolver was dropped without producing a result
    #[error("batch result abandoned before resolution")]
    Abandoned,
}

impl BatchError {
    /// Wrap a batch function's per-item error.
    pub fn failed(err: BoxError) -> Self {
        Self::Failed(Arc::from(err))
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration text could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration could not be serialized
    #[error("failed to serialize configuration: {0}")]
    Serialize(String),

    /// A field holds a value strict validation rejects
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

/// Result type used throughout the Vigil core.
pub type Result<T> = std::result::Result<T, Error>;
