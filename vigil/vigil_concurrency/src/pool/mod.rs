//! Pooling of reusable values, external connections and executor threads.
//!
//! - [`Pool`]: reusable in-process values such as scratch buffers
//! - [`ConnectionPool`]: bounded, idle-evicting pool of external connections
//! - [`WorkerPool`]: fixed executor threads fed by a bounded task queue

pub mod connection;
pub mod object;
pub mod worker;

pub use connection::{ConnectionPool, ConnectionPoolStats, PooledConnection};
pub use object::{Pool, PoolStats, Pooled};
pub use worker::{Task, WorkerPool, WorkerPoolStats};
