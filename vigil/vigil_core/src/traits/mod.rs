//! Interfaces for the external collaborators the core depends on.
//!
//! - `Connection`: an opaque external-service handle (the RPC client)
//! - `ConnectionFactory`: how a pool opens new connections

pub mod connection;

pub use connection::{Connection, ConnectionFactory};
