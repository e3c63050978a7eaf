//! Strongly-typed identifiers.
//!
//! Pools and the connections they hand out are identified by UUIDs wrapped
//! in a phantom-typed [`Id`], so a pool identifier can never be compared
//! against a connection identifier by accident.
//!
//! # Examples
//!
//! ```
//! use vigil_core::id::{ConnectionId, PoolId};
//! use std::str::FromStr;
//!
//! let pool_id = PoolId::new();
//! let conn_id = ConnectionId::new();
//! assert_ne!(pool_id.to_string(), conn_id.to_string());
//!
//! let id_str = "550e8400-e29b-41d4-a716-446655440000";
//! let pool_id = PoolId::from_str(id_str).unwrap();
//! assert_eq!(pool_id.to_string(), id_str);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// A type-safe identifier based on UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Id<T> {
    uuid: Uuid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Create an identifier from a known UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    /// Get the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_uuid(Uuid::parse_str(s)?))
    }
}

/// Marker type for connection pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolMarker;
/// Identifier for a connection pool.
pub type PoolId = Id<PoolMarker>;

/// Marker type for pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionMarker;
/// Identifier for a connection owned by a pool.
pub type ConnectionId = Id<ConnectionMarker>;
