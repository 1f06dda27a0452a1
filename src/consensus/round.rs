//! Cache (open) and final (closed) rounds of a single node.

use serde::{Deserialize, Serialize};

use super::snapshot::{NodeId, RoundLink, Snapshot};
use crate::Hash;

/// An immutable closed round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRound {
    pub node_id: NodeId,
    pub number: u64,
    /// Timestamp of the round's earliest snapshot (ns).
    pub start: u64,
    pub hash: Hash,
}

impl FinalRound {
    /// Round 0 of `node_id`, shared by every participant at genesis.
    pub fn genesis(node_id: NodeId, timestamp: u64) -> Self {
        FinalRound {
            node_id,
            number: 0,
            start: timestamp,
            hash: crate::hash_domain("meridian.genesis.round", &node_id),
        }
    }
}

/// The currently open round of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRound {
    pub node_id: NodeId,
    pub number: u64,
    /// Latest snapshot timestamp stamped into this round; never decreases.
    pub timestamp: u64,
    pub references: RoundLink,
    /// Finalized snapshots of this round.
    pub snapshots: Vec<Snapshot>,
}

impl CacheRound {
    pub fn new(node_id: NodeId, number: u64, references: RoundLink) -> Self {
        CacheRound {
            node_id,
            number,
            timestamp: 0,
            references,
            snapshots: Vec::new(),
        }
    }

    /// Earliest and latest timestamps of the round's snapshots.
    ///
    /// `None` while the round holds no finalized snapshot.
    pub fn gap(&self) -> Option<(u64, u64)> {
        let start = self.snapshots.iter().map(|s| s.timestamp).min()?;
        let end = self.snapshots.iter().map(|s| s.timestamp).max()?;
        Some((start, end))
    }

    /// Check that `s` belongs in this round; with `add`, append it.
    ///
    /// The round's snapshots must all fit within one `round_gap` and may not
    /// share a hash, a timestamp or a transaction.
    pub fn validate_snapshot(&mut self, s: &Snapshot, add: bool, round_gap: u64) -> bool {
        if s.node_id != self.node_id || s.round_number != self.number {
            return false;
        }
        if s.references != self.references {
            return false;
        }
        let conflict = self.snapshots.iter().any(|cs| {
            cs.hash == s.hash || cs.timestamp == s.timestamp || cs.transaction == s.transaction
        });
        if conflict {
            return false;
        }
        if let Some((start, end)) = self.gap() {
            if s.timestamp >= start.saturating_add(round_gap)
                || s.timestamp.saturating_add(round_gap) <= end
            {
                return false;
            }
        }
        if add {
            self.snapshots.push(s.clone());
            if s.timestamp > self.timestamp {
                self.timestamp = s.timestamp;
            }
        }
        true
    }

    /// Freeze this round. `None` while it holds no finalized snapshot.
    pub fn as_final(&self) -> Option<FinalRound> {
        let (start, _) = self.gap()?;
        let mut ordered: Vec<&Snapshot> = self.snapshots.iter().collect();
        ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.hash.cmp(&b.hash)));

        let mut hasher = blake3::Hasher::new_derive_key("meridian.final.round");
        hasher.update(&self.node_id);
        hasher.update(&self.number.to_le_bytes());
        for s in ordered {
            hasher.update(&s.hash);
        }
        Some(FinalRound {
            node_id: self.node_id,
            number: self.number,
            start,
            hash: *hasher.finalize().as_bytes(),
        })
    }
}
