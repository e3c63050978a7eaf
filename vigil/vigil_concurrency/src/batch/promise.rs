//! Single-assignment result slots for batched items.
//!
//! A [`ResultPromise`] is handed to the submitter; the matching
//! `PromiseResolver` travels with the batch. Resolving consumes the
//! resolver, and a resolver dropped without resolving settles its promise
//! with [`BatchError::Abandoned`], so a promise never stays pending forever.

use log::warn;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vigil_core::error::BatchError;

enum Slot<R> {
    Pending,
    Ready(Result<R, BatchError>),
    Taken,
}

struct PromiseCell<R> {
    slot: Mutex<Slot<R>>,
    ready: Condvar,
}

impl<R> PromiseCell<R> {
    /// Store the result and wake every waiter. Returns false if the slot
    /// was already resolved.
    fn set(&self, result: Result<R, BatchError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            debug_assert!(false, "promise resolved twice");
            warn!("Ignoring second resolution of a batch promise");
            return false;
        }
        *slot = Slot::Ready(result);
        drop(slot);
        self.ready.notify_all();
        true
    }
}

/// Create a linked resolver and promise.
pub(crate) fn pair<R>() -> (PromiseResolver<R>, ResultPromise<R>) {
    let cell = Arc::new(PromiseCell {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
    });
    (
        PromiseResolver {
            cell: Some(Arc::clone(&cell)),
        },
        ResultPromise { cell },
    )
}

/// Producer side of a promise
pub(crate) struct PromiseResolver<R> {
    cell: Option<Arc<PromiseCell<R>>>,
}

impl<R> PromiseResolver<R> {
    pub(crate) fn resolve(mut self, result: Result<R, BatchError>) {
        if let Some(cell) = self.cell.take() {
            cell.set(result);
        }
    }
}

impl<R> Drop for PromiseResolver<R> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.set(Err(BatchError::Abandoned));
        }
    }
}

/// The eventual result of one batched item.
///
/// Resolved exactly once, with the item's entry from the batch function's
/// output or with a [`BatchError`].
pub struct ResultPromise<R> {
    cell: Arc<PromiseCell<R>>,
}

impl<R> ResultPromise<R> {
    /// Whether the result is available.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.cell.slot.lock(), Slot::Pending)
    }

    /// Block until resolved and take the result.
    pub fn into_result(self) -> Result<R, BatchError> {
        let mut slot = self.cell.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.cell.ready.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Pending | Slot::Taken => Err(BatchError::Abandoned),
        }
    }
}

impl<R: Clone> ResultPromise<R> {
    /// Block until resolved and return a copy of the result. Every call
    /// after resolution returns immediately.
    pub fn wait(&self) -> Result<R, BatchError> {
        let mut slot = self.cell.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.cell.ready.wait(&mut slot);
        }
        read(&slot)
    }

    /// Like [`wait`](Self::wait), failing with [`BatchError::Timeout`] if
    /// the promise is still pending after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, BatchError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.cell.slot.lock();
        while matches!(*slot, Slot::Pending) {
            if self.cell.ready.wait_until(&mut slot, deadline).timed_out() {
                if matches!(*slot, Slot::Pending) {
                    return Err(BatchError::Timeout(timeout));
                }
                break;
            }
        }
        read(&slot)
    }

    /// The result if already resolved, without blocking.
    pub fn try_result(&self) -> Option<Result<R, BatchError>> {
        let slot = self.cell.slot.lock();
        match *slot {
            Slot::Pending => None,
            _ => Some(read(&slot)),
        }
    }
}

fn read<R: Clone>(slot: &Slot<R>) -> Result<R, BatchError> {
    match slot {
        Slot::Ready(result) => result.clone(),
        Slot::Pending | Slot::Taken => Err(BatchError::Abandoned),
    }
}

impl<R> fmt::Debug for ResultPromise<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultPromise")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolve_then_wait_repeatedly() {
        let (resolver, promise) = pair::<u64>();
        assert!(!promise.is_resolved());
        assert!(promise.try_result().is_none());

        resolver.resolve(Ok(7));
        assert!(promise.is_resolved());
        assert_eq!(promise.wait().unwrap(), 7);
        assert_eq!(promise.wait().unwrap(), 7);
        assert_eq!(promise.try_result().unwrap().unwrap(), 7);
        assert_eq!(promise.into_result().unwrap(), 7);
    }

    #[test]
    fn test_wait_blocks_until_resolved() {
        let (resolver, promise) = pair::<String>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(Ok("0xbeef".to_string()));
        });

        assert_eq!(promise.wait().unwrap(), "0xbeef");
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let (resolver, promise) = pair::<u8>();
        let err = promise.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, BatchError::Timeout(_)));

        resolver.resolve(Err(BatchError::Cancelled));
        let err = promise.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, BatchError::Cancelled));
    }

    #[test]
    fn test_dropped_resolver_abandons() {
        let (resolver, promise) = pair::<u8>();
        drop(resolver);
        assert!(matches!(promise.wait(), Err(BatchError::Abandoned)));
    }

    #[test]
    fn test_into_result_without_clone() {
        struct NotClone(u8);

        let (resolver, promise) = pair::<NotClone>();
        resolver.resolve(Ok(NotClone(3)));
        assert_eq!(promise.into_result().unwrap().0, 3);
    }

    #[test]
    fn test_second_set_is_rejected() {
        let (resolver, promise) = pair::<u8>();
        let cell = Arc::clone(&promise.cell);
        resolver.resolve(Ok(1));

        // Only reachable through the cell; the resolver is consumed.
        if !cfg!(debug_assertions) {
            assert!(!cell.set(Ok(2)));
        }
        assert_eq!(promise.wait().unwrap(), 1);
    }
}
