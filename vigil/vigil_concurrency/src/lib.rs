#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Vigil Concurrency
//!
//! Concurrency primitives for the Vigil wallet monitor.
//!
//! This crate provides the building blocks the monitor's processes compose:
//!
//! - Object and connection pooling with bounded capacity and idle eviction
//! - A worker pool with bounded task, result and error queues
//! - A fan-out pipeline with backpressure
//! - Request batching with per-item promises
//!
//! Every component owns a [`CancellationToken`](sync::CancellationToken).
//! Closing a component fires its token, stops intake, and lets its threads
//! drain and exit. Closing twice is always a no-op.
//!
//! All threads are plain OS threads with names derived from the component's
//! configuration. Logging goes through the `log` facade; the embedding
//! binary picks the logger.

/// Request batching with per-item promises
pub mod batch;

/// Fan-out processing stage
pub mod pipeline;

/// Object, connection and worker pools
pub mod pool;

/// Cancellation and atomic building blocks
pub mod sync;

// Re-export key types for easier access
pub use batch::{BatchProcessor, ResultPromise};
pub use pipeline::Pipeline;
pub use pool::{ConnectionPool, Pool, PooledConnection, WorkerPool};
pub use sync::CancellationToken;
