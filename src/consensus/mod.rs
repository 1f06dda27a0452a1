//! # Local-Round Consensus
//!
//! Every consensus node produces its own chain of rounds. A round is a
//! time-bounded batch of snapshots, each snapshot carrying one transaction.
//!
//! ## Design Principles
//!
//! 1. **Per-node rounds**: a node only ever signs snapshots into its own open
//!    round. Round numbers increase by one with no gaps.
//!
//! 2. **DAG linkage**: a new round references the node's previous closed
//!    round and the best closed round of another node, so the per-node chains
//!    weave into one DAG.
//!
//! 3. **Quorum finalization**: a snapshot is final once `n * 2/3 + 1`
//!    distinct consensus nodes have signed it. Finalized snapshots receive a
//!    global topological order.
//!
//! ## How It Works
//!
//! ```text
//! Node A, round N open (references: A/N-1, B/M):
//!   1. Take an unsigned snapshot from the queue
//!   2. If the first finalized snapshot of round N is older than one gap,
//!      close round N and open N+1 -> (A/N, best peer round)
//!   3. Stamp round number, references and a fresh timestamp; sign
//!   4. Send to every peer; peers admit the transaction and co-sign
//!   5. On quorum: assign topological order, persist, add to round N+1
//! ```
//!
//! ## Backpressure
//!
//! Unfinalized self-signed snapshots are tracked in a [`backpressure::CachePool`].
//! Once they spread over two thirds of a round the node stops signing until
//! they finalize or the oldest has waited one and a half rounds.

pub mod backpressure;
pub mod graph;
pub mod quorum;
pub mod round;
pub mod snapshot;
pub mod topo;

pub use graph::{RoundError, RoundGraph, SelectionError};
pub use quorum::{ConsensusNode, SignaturePool, SignatureSet};
pub use round::{CacheRound, FinalRound};
pub use snapshot::{NodeId, RoundLink, Snapshot, SnapshotWithTopologicalOrder};
pub use topo::TopoCounter;
