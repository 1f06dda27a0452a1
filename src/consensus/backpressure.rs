//! Timing-based backpressure on self-snapshot production.

use super::snapshot::Snapshot;
use crate::Hash;

/// Whether a node holding unfinalized snapshots stamped at `timestamps` may
/// sign another one at `now`.
///
/// Capacity is refused while the pending snapshots already spread over two
/// thirds of a round, unless the oldest has been waiting one and a half
/// rounds.
pub fn has_capacity(timestamps: &mut [u64], now: u64, round_gap: u64) -> bool {
    if timestamps.is_empty() {
        return true;
    }
    timestamps.sort_unstable();
    let oldest = timestamps[0];
    let newest = timestamps[timestamps.len() - 1];
    if now >= oldest.saturating_add(round_gap / 2 * 3) {
        return true;
    }
    newest < oldest.saturating_add(round_gap / 3 * 2)
}

/// Locally signed snapshots that have not finalized yet.
#[derive(Clone, Debug, Default)]
pub struct CachePool {
    snapshots: Vec<Snapshot>,
}

impl CachePool {
    pub fn push(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn remove(&mut self, hash: &Hash) {
        self.snapshots.retain(|s| s.hash != *hash);
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn check_capacity(&self, now: u64, round_gap: u64) -> bool {
        let mut timestamps: Vec<u64> = self.snapshots.iter().map(|s| s.timestamp).collect();
        has_capacity(&mut timestamps, now, round_gap)
    }
}
