//! Consensus membership and co-signature aggregation.

use std::collections::{BTreeSet, HashMap};

use super::snapshot::{NodeId, Snapshot};
use crate::crypto::keys::{Signature, SigningPublicKey};
use crate::transaction::SignedTransaction;
use crate::Hash;

/// A node whose signature counts towards quorum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusNode {
    pub id: NodeId,
    pub public_key: SigningPublicKey,
}

impl ConsensusNode {
    pub fn new(public_key: SigningPublicKey) -> Self {
        ConsensusNode {
            id: public_key.fingerprint(),
            public_key,
        }
    }
}

/// Co-signatures collected for one snapshot.
///
/// Signatures are deduplicated by their bytes; quorum counts distinct
/// signers, so the merge result is independent of arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureSet {
    signatures: BTreeSet<Signature>,
    signers: BTreeSet<NodeId>,
}

impl SignatureSet {
    /// Add one verified signature. Returns whether anything was new.
    pub fn insert(&mut self, signer: NodeId, signature: Signature) -> bool {
        let new_sig = self.signatures.insert(signature);
        let new_signer = self.signers.insert(signer);
        new_sig || new_signer
    }

    /// Set union with `other`.
    pub fn merge(&mut self, other: &SignatureSet) {
        self.signatures.extend(other.signatures.iter().cloned());
        self.signers.extend(other.signers.iter().copied());
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    pub fn has_quorum(&self, threshold: usize) -> bool {
        self.signers.len() >= threshold
    }

    /// Signatures in canonical (byte) order.
    pub fn to_vec(&self) -> Vec<Signature> {
        self.signatures.iter().cloned().collect()
    }
}

/// A self-signed snapshot awaiting co-signatures.
#[derive(Clone, Debug)]
pub struct PendingSnapshot {
    pub snapshot: Snapshot,
    pub transaction: SignedTransaction,
    pub own_signature: Signature,
    pub signatures: SignatureSet,
}

/// Snapshots this node signed and has not finalized yet, by hash.
#[derive(Debug, Default)]
pub struct SignaturePool {
    pending: HashMap<Hash, PendingSnapshot>,
}

impl SignaturePool {
    /// Start collecting for a freshly self-signed snapshot.
    pub fn open(
        &mut self,
        snapshot: Snapshot,
        transaction: SignedTransaction,
        signer: NodeId,
        own_signature: Signature,
    ) {
        let mut signatures = SignatureSet::default();
        signatures.insert(signer, own_signature.clone());
        self.pending.insert(
            snapshot.hash,
            PendingSnapshot {
                snapshot,
                transaction,
                own_signature,
                signatures,
            },
        );
    }

    pub fn get(&self, hash: &Hash) -> Option<&PendingSnapshot> {
        self.pending.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.pending.contains_key(hash)
    }

    /// Union `incoming` into a pending entry.
    ///
    /// Returns the merged set, or `None` when nothing is pending for `hash`.
    pub fn merge_signatures(
        &mut self,
        hash: &Hash,
        incoming: &SignatureSet,
    ) -> Option<&SignatureSet> {
        let entry = self.pending.get_mut(hash)?;
        entry.signatures.merge(incoming);
        Some(&entry.signatures)
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<PendingSnapshot> {
        self.pending.remove(hash)
    }

    /// Drop every pending entry (used when the local round rotates).
    pub fn drain(&mut self) -> Vec<PendingSnapshot> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Verify a quorum certificate: `threshold` distinct consensus nodes must
/// have signed `msg`.
pub fn verify_quorum(
    nodes: &[ConsensusNode],
    msg: &[u8],
    signatures: &[Signature],
    threshold: usize,
) -> bool {
    let mut signers = BTreeSet::new();
    for sig in signatures {
        if let Some(node) = nodes.iter().find(|n| n.public_key.verify(msg, sig)) {
            signers.insert(node.id);
        }
    }
    signers.len() >= threshold
}
