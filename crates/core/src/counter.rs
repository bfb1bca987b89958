//! Cache-line-aligned atomic counters
//!
//! The force path bumps several counters on every thunk. Aligning each one
//! to its own cache line keeps parallel evaluator threads from false-sharing
//! the hot ones.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically-increasing event counter.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct Counter {
    inner: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Counter {
            inner: AtomicU64::new(0),
        }
    }

    pub fn bump(&self) {
        self.inner.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.inner.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}
