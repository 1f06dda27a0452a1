//! Replicated round state of every consensus node.
//!
//! The graph tracks the local node's open round plus, for each node (local
//! included), the last closed round and a bounded window of closed rounds.
//! Peers' windows are fed by round gossip and drive the choice of external
//! reference when the local node rotates.

use std::collections::{HashMap, VecDeque};

use super::round::{CacheRound, FinalRound};
use super::snapshot::NodeId;

/// Why a peer round was not appended to its node's history.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoundError {
    #[error("round {got} does not extend last round {last}")]
    Gap { last: u64, got: u64 },
    #[error("round {number} starts before its predecessor")]
    StartRegression { number: u64 },
    #[error("conflicting hash for round {number}")]
    Conflict { number: u64 },
}

/// Outcome of external reference selection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// No other node has ever closed a round.
    #[error("no peer rounds known")]
    NoPeerRounds,
    /// Peer rounds exist but none has closed its time window yet.
    #[error("no eligible peer round")]
    NoEligibleRound,
}

pub struct RoundGraph {
    my_id: NodeId,
    window: usize,
    cache: CacheRound,
    finals: HashMap<NodeId, FinalRound>,
    history: HashMap<NodeId, VecDeque<FinalRound>>,
}

impl RoundGraph {
    /// `window` is the number of closed rounds kept per node.
    pub fn new(cache: CacheRound, window: usize) -> Self {
        RoundGraph {
            my_id: cache.node_id,
            window: window.max(1),
            cache,
            finals: HashMap::new(),
            history: HashMap::new(),
        }
    }

    pub fn my_id(&self) -> &NodeId {
        &self.my_id
    }

    /// The local node's open round.
    pub fn cache_round(&self) -> &CacheRound {
        &self.cache
    }

    pub fn cache_round_mut(&mut self) -> &mut CacheRound {
        &mut self.cache
    }

    /// Replace the local open round with an updated copy.
    pub fn commit_cache_round(&mut self, cache: CacheRound) {
        self.cache = cache;
    }

    pub fn final_round(&self, node_id: &NodeId) -> Option<&FinalRound> {
        self.finals.get(node_id)
    }

    /// Closed rounds of `node_id`, oldest first.
    pub fn history(&self, node_id: &NodeId) -> impl Iterator<Item = &FinalRound> {
        self.history.get(node_id).into_iter().flatten()
    }

    /// Install a closed round without continuity checks (startup seeding).
    pub fn seed_final_round(&mut self, round: FinalRound) {
        let node_id = round.node_id;
        self.push_history(round.clone());
        self.finals.insert(node_id, round);
    }

    /// Close the local round: record `closed` and open `next`.
    pub fn rotate(&mut self, closed: FinalRound, next: CacheRound) {
        self.seed_final_round(closed);
        self.cache = next;
    }

    /// Append a gossiped peer round.
    ///
    /// Returns `Ok(false)` for a round that is already known.
    pub fn update_final_round(&mut self, round: FinalRound) -> Result<bool, RoundError> {
        if let Some(last) = self.finals.get(&round.node_id) {
            if round.number <= last.number {
                let known = self
                    .history(&round.node_id)
                    .find(|r| r.number == round.number);
                return match known {
                    Some(r) if r.hash != round.hash => Err(RoundError::Conflict {
                        number: round.number,
                    }),
                    _ => Ok(false),
                };
            }
            // A missed announcement leaves this peer stuck at `last`; only a
            // state sync can fill the hole.
            if round.number != last.number + 1 {
                return Err(RoundError::Gap {
                    last: last.number,
                    got: round.number,
                });
            }
            if round.start < last.start {
                return Err(RoundError::StartRegression {
                    number: round.number,
                });
            }
        }
        self.seed_final_round(round);
        Ok(true)
    }

    fn push_history(&mut self, round: FinalRound) {
        let rounds = self.history.entry(round.node_id).or_default();
        rounds.push_back(round);
        while rounds.len() > self.window {
            rounds.pop_front();
        }
    }

    /// Choose the external reference for the next local round.
    ///
    /// Each other node's most recent closed round is a candidate once the
    /// node's history window projects past `now`. Longer windows win, then
    /// later starts.
    pub fn select_best_round(&self, now: u64, round_gap: u64) -> Result<FinalRound, SelectionError> {
        let mut ids: Vec<&NodeId> = self.history.keys().filter(|id| **id != self.my_id).collect();
        ids.sort();

        let mut best: Option<&FinalRound> = None;
        let (mut start, mut height) = (0u64, 0u64);
        let mut any_peer = false;
        for id in ids {
            let rounds = &self.history[id];
            let (Some(oldest), Some(latest)) = (rounds.front(), rounds.back()) else {
                continue;
            };
            any_peer = true;
            let len = rounds.len() as u64;
            if len < height {
                continue;
            }
            if oldest.start.saturating_add(round_gap.saturating_mul(len)) > now {
                continue;
            }
            if len > height || latest.start > start {
                best = Some(latest);
                start = latest.start;
                height = len;
            }
        }

        match best {
            Some(round) => Ok(round.clone()),
            None if any_peer => Err(SelectionError::NoEligibleRound),
            None => Err(SelectionError::NoPeerRounds),
        }
    }

    /// Whether every other consensus node has at least one known closed round.
    pub fn check_sync<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) -> bool {
        nodes
            .into_iter()
            .filter(|id| **id != self.my_id)
            .all(|id| self.finals.contains_key(id))
    }
}
