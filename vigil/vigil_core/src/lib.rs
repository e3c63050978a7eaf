//! # Vigil Core
//!
//! `vigil_core` holds the pieces of the Vigil wallet monitor that every
//! concurrency primitive shares: the error taxonomy, the configuration
//! surface, typed identifiers, and the traits describing the external
//! collaborators (the RPC connection and its factory).
//!
//! ## Crate Structure
//!
//! - **error**: one error enum per primitive plus the root `Error`
//! - **config**: serde-backed configuration with clamping and validation
//! - **id**: strongly-typed UUID identifiers
//! - **traits**: `Connection` and `ConnectionFactory`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod id;
pub mod traits;

pub use config::{
    BatchConfig, ConnectionPoolConfig, PipelineConfig, VigilConfig, WorkerPoolConfig,
};
pub use error::{
    BatchError, BoxError, ConfigError, Error, PipelineError, PoolError, Result, WorkerError,
};
pub use id::{ConnectionId, PoolId};
pub use traits::{Connection, ConnectionFactory};
