//! Synchronization building blocks shared by the pools, the pipeline and
//! the batch processor:
//!
//! - A cancellation token that can take part in `select!` waits
//! - Atomic counters and flags for in-flight accounting and statistics

pub mod atomic;
pub mod cancel;

pub use atomic::{AtomicCounter, AtomicFlag, AtomicMax};
pub use cancel::CancellationToken;

use std::any::Any;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown panic>".to_string()
    }
}
