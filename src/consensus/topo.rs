//! Global topological order of finalized snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out one order value per finalization; values are never reused.
#[derive(Debug)]
pub struct TopoCounter {
    next: AtomicU64,
}

impl TopoCounter {
    /// Continue after `finalized` snapshots already in the ledger.
    pub fn new(finalized: u64) -> Self {
        TopoCounter {
            next: AtomicU64::new(finalized),
        }
    }

    /// Take the next order value.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to [`TopoCounter::next`] will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
