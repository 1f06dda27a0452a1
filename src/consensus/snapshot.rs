//! Snapshots: one transaction bound to one round of one node.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::Signature;
use crate::Hash;

/// Node identity: fingerprint of the node's signing public key.
pub type NodeId = Hash;

/// The two DAG edges a round commits to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundLink {
    /// Hash of the node's own previous final round.
    pub self_ref: Hash,
    /// Hash of the chosen final round of another node.
    pub external: Hash,
}

/// A unit of work: one transaction stamped into a node's round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_id: NodeId,
    pub round_number: u64,
    /// Nanoseconds since the UNIX epoch; zero until signed.
    pub timestamp: u64,
    /// Hash of the carried transaction.
    pub transaction: Hash,
    pub references: RoundLink,
    pub signatures: Vec<Signature>,
    /// Payload hash; zero until signed.
    pub hash: Hash,
}

impl Snapshot {
    /// An unsigned shell for `transaction`, ready to be queued for signing.
    pub fn new(node_id: NodeId, transaction: Hash) -> Self {
        Snapshot {
            node_id,
            round_number: 0,
            timestamp: 0,
            transaction,
            references: RoundLink::default(),
            signatures: Vec::new(),
            hash: [0u8; 32],
        }
    }

    /// Hash over everything but signatures and the hash itself.
    pub fn payload_hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new_derive_key("meridian.snapshot");
        hasher.update(&self.node_id);
        hasher.update(&self.round_number.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.transaction);
        hasher.update(&self.references.self_ref);
        hasher.update(&self.references.external);
        *hasher.finalize().as_bytes()
    }

    /// Whether this is an unsigned shell the signer may accept.
    pub fn is_unsigned_shell(&self) -> bool {
        self.signatures.is_empty() && self.timestamp == 0
    }

    /// Strip round stamping and signatures so the snapshot can be signed again.
    pub fn reset(&mut self) {
        self.round_number = 0;
        self.timestamp = 0;
        self.references = RoundLink::default();
        self.signatures.clear();
        self.hash = [0u8; 32];
    }
}

/// A finalized snapshot with its position in the global ledger order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWithTopologicalOrder {
    pub snapshot: Snapshot,
    pub topological_order: u64,
}
