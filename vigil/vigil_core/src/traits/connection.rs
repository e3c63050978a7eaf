//! Connection trait definitions.
//!
//! The blockchain RPC client is an external collaborator. The pool only
//! needs to know how to create a handle, whether a handle is still usable,
//! and how to close it.

use crate::error::BoxError;

/// An external-service handle that can be pooled.
///
/// # Examples
///
/// ```
/// use vigil_core::error::BoxError;
/// use vigil_core::traits::Connection;
///
/// struct RpcClient {
///     open: bool,
/// }
///
/// impl Connection for RpcClient {
///     fn close(&mut self) -> Result<(), BoxError> {
///         self.open = false;
///         Ok(())
///     }
///
///     fn is_valid(&self) -> bool {
///         self.open
///     }
/// }
/// ```
pub trait Connection: Send + 'static {
    /// Release the underlying resource.
    ///
    /// Called exactly once per connection by the pool that created it. Errors
    /// are logged by the pool and otherwise ignored.
    fn close(&mut self) -> Result<(), BoxError>;

    /// Whether the connection can still be handed out.
    ///
    /// Idle connections that report `false` are closed instead of reused.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Creates new connections for a pool.
///
/// Implemented for any `Fn() -> Result<C, BoxError>` closure, so most callers
/// never name this trait.
pub trait ConnectionFactory<C>: Send + Sync + 'static {
    /// Open a new connection.
    fn create(&self) -> Result<C, BoxError>;
}

impl<C, F> ConnectionFactory<C> for F
where
    F: Fn() -> Result<C, BoxError> + Send + Sync + 'static,
{
    fn create(&self) -> Result<C, BoxError> {
        self()
    }
}
