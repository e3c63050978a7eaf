//! Shared cancellation signal.
//!
//! A [`CancellationToken`] is a cheap, cloneable handle. Cancelling any clone
//! cancels all of them. Besides the polling check
//! [`is_cancelled`](CancellationToken::is_cancelled), the token exposes a
//! channel that disconnects on cancellation, so a blocking wait can include it
//! as one arm of a `crossbeam_channel::select!`:
//!
//! ```
//! use crossbeam_channel::{bounded, select};
//! use vigil_concurrency::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let (_tx, rx) = bounded::<u32>(1);
//!
//! token.cancel();
//! select! {
//!     recv(rx) -> _ => unreachable!(),
//!     recv(token.cancelled()) -> _ => {}
//! }
//! ```

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct TokenInner {
    cancelled: AtomicBool,
    /// Dropped on cancel; nothing is ever sent on it.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// A cloneable, one-way cancellation signal.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Cancel the token and every clone of it. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A receiver that becomes ready (disconnected) once the token is cancelled.
    ///
    /// Only useful as a `select!` arm; it never yields a value.
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Block until the token is cancelled or `timeout` elapses.
    ///
    /// Returns true if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let _ = self.inner.signal.recv_timeout(timeout);
        self.is_cancelled()
    }

    /// Send `value` on `tx`, blocking while the channel is full, unless the
    /// token is cancelled first.
    ///
    /// Returns false if the value was dropped because of cancellation or
    /// because the receiving side is gone.
    pub fn send<T>(&self, tx: &Sender<T>, value: T) -> bool {
        if self.is_cancelled() {
            return false;
        }
        select! {
            send(tx, value) -> res => res.is_ok(),
            recv(self.inner.signal) -> _ => false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
