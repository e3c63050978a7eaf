//! Atomic counters and flags.
//!
//! Used for in-flight accounting, statistics and one-shot state changes
//! such as "closed".

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// A counter that can be incremented and read atomically.
///
/// Decrements saturate at zero instead of wrapping.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicUsize,
}

impl AtomicCounter {
    /// Create a new counter with an initial value.
    pub fn new(initial_value: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial_value),
        }
    }

    /// Increment the counter and return the new value.
    pub fn increment(&self) -> usize {
        self.add(1)
    }

    /// Add `n` and return the new value.
    pub fn add(&self, n: usize) -> usize {
        self.value.fetch_add(n, Ordering::SeqCst) + n
    }

    /// Decrement the counter and return the new value.
    pub fn decrement(&self) -> usize {
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Get the current value of the counter.
    pub fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }
}

/// A running maximum, e.g. the slowest task seen so far.
#[derive(Debug, Default)]
pub struct AtomicMax {
    value: AtomicU64,
}

impl AtomicMax {
    /// Raise the stored maximum to `candidate` if it is larger.
    pub fn observe(&self, candidate: u64) {
        self.value.fetch_max(candidate, Ordering::Relaxed);
    }

    /// Get the largest value observed.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A flag that can be atomically set.
#[derive(Debug, Default)]
pub struct AtomicFlag {
    flag: AtomicBool,
}

impl AtomicFlag {
    /// Create a new flag with the specified initial state.
    pub fn new(initial_state: bool) -> Self {
        Self {
            flag: AtomicBool::new(initial_state),
        }
    }

    /// Get the current state of the flag.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Set the flag if it's not already set.
    ///
    /// Returns true if the flag was set by this call, false if it was already set.
    /// Shutdown paths use this so only the first caller does the work.
    pub fn try_set(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }
}
