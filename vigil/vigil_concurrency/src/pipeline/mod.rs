//! Fan-out processing stage with backpressure.
//!
//! A [`Pipeline`] runs a transform over submitted items on a fixed number of
//! worker threads. Input, result and error queues are bounded, so a slow
//! consumer eventually blocks `submit`.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use vigil_concurrency::pipeline::Pipeline;
//! use vigil_core::config::PipelineConfig;
//!
//! let pipeline = Pipeline::new(PipelineConfig::default(), |_token, balance: u64| {
//!     Ok::<_, String>(balance / 1_000)
//! })
//! .unwrap();
//!
//! pipeline.submit(42_000).unwrap();
//! let scaled = pipeline.results().recv_timeout(Duration::from_secs(5)).unwrap();
//! assert_eq!(scaled, 42);
//!
//! pipeline.close();
//! assert_eq!(pipeline.processing_count(), 0);
//! ```

pub mod stage;

pub use stage::{Pipeline, PipelineStats};
