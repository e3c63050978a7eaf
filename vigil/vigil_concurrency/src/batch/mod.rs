//! Request batching.
//!
//! Individual lookups (say, one balance query per wallet) are collected by a
//! [`BatchProcessor`] and issued as a single batch call. Each caller gets a
//! [`ResultPromise`] that resolves with its own entry of the batch output.

pub mod processor;
pub mod promise;

pub use processor::{BatchProcessor, BatchStats};
pub use promise::ResultPromise;
