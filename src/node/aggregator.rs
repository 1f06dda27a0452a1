//! Signature aggregation and finalization.

use crate::consensus::quorum::{verify_quorum, SignatureSet};
use crate::consensus::snapshot::{NodeId, Snapshot, SnapshotWithTopologicalOrder};
use crate::network::{SnapshotMode, Transport};
use crate::storage::RoundStore;

use super::{KernelError, Node};

impl<S: RoundStore, T: Transport> Node<S, T> {
    /// Merge a peer's co-signature into a pending self snapshot and finalize
    /// it once quorum is reached.
    ///
    /// Signatures for snapshots no longer pending are ignored, so delivering
    /// the same signatures twice finalizes once.
    pub async fn collect_self_signatures(
        &self,
        s: Snapshot,
        sender: NodeId,
    ) -> Result<(), KernelError> {
        if s.node_id != self.id {
            return Err(KernelError::Invariant("co-signature for another node's snapshot"));
        }
        if s.signatures.len() != 1 {
            return Err(KernelError::Invariant("co-signature message must carry one signature"));
        }
        let signer = self
            .consensus_node(&sender)
            .ok_or(KernelError::UnknownSigner(sender))?;
        let signature = &s.signatures[0];
        if !signer.public_key.verify(&s.hash, signature) {
            return Err(KernelError::InvalidSignature(sender));
        }
        let gap = self.config.snapshot_round_gap;

        let mut state = self.state.lock().await;
        let Some(pending) = state.pool.get(&s.hash) else {
            return Ok(());
        };
        let ours = pending.snapshot.clone();
        let mut cache = state.graph.cache_round().clone();
        if ours.round_number < cache.number || !cache.validate_snapshot(&ours, false, gap) {
            let stale = state.pool.remove(&s.hash);
            state.cache_pool.remove(&s.hash);
            drop(state);
            if let Some(stale) = stale {
                tracing::debug!(
                    snapshot = %crate::short_hex(&s.hash),
                    round = stale.snapshot.round_number,
                    "Stale self snapshot, requeueing"
                );
                self.requeue(stale.snapshot, stale.transaction);
            }
            return Ok(());
        }

        let threshold = self.quorum_threshold();
        let mut incoming = SignatureSet::default();
        incoming.insert(sender, signature.clone());
        let signatures = match state.pool.merge_signatures(&s.hash, &incoming) {
            Some(set) if set.has_quorum(threshold) => set.to_vec(),
            _ => return Ok(()),
        };

        let mut finalized = ours;
        finalized.signatures = signatures;
        let topo = SnapshotWithTopologicalOrder {
            snapshot: finalized,
            topological_order: self.topo.next(),
        };
        self.store.write_snapshot(&topo).map_err(|e| {
            KernelError::Fatal(format!(
                "persist snapshot {}: {}",
                crate::short_hex(&s.hash),
                e
            ))
        })?;
        if !cache.validate_snapshot(&topo.snapshot, true, gap) {
            return Err(KernelError::Invariant("finalized snapshot rejected by its round"));
        }
        state.graph.commit_cache_round(cache);
        state.pool.remove(&s.hash);
        state.cache_pool.remove(&s.hash);
        drop(state);

        tracing::info!(
            snapshot = %crate::short_hex(&s.hash),
            round = topo.snapshot.round_number,
            order = topo.topological_order,
            signers = topo.snapshot.signatures.len(),
            "Finalized self snapshot"
        );

        let finalized = &topo.snapshot;
        self.broadcast(|peer| {
            self.transport
                .send_snapshot_message(peer, finalized, SnapshotMode::Finalized)
        })
        .await
    }

    /// Record a peer's finalized snapshot in the local ledger order.
    ///
    /// The snapshot must carry a quorum of consensus signatures and its
    /// transaction must be known locally.
    pub async fn accept_finalized_snapshot(&self, s: Snapshot) -> Result<(), KernelError> {
        if s.node_id == self.id {
            return Ok(());
        }
        if !crate::hash_eq(&s.hash, &s.payload_hash()) {
            tracing::debug!(snapshot = %crate::short_hex(&s.hash), "Dropped snapshot with bad hash");
            return Ok(());
        }
        if !verify_quorum(&self.nodes, &s.hash, &s.signatures, self.quorum_threshold()) {
            tracing::debug!(snapshot = %crate::short_hex(&s.hash), "Dropped snapshot without quorum");
            return Ok(());
        }
        if self.store.read_snapshot(&s.hash)?.is_some() {
            return Ok(());
        }
        if self.store.check_transaction_finalization(&s.transaction)? {
            tracing::warn!(
                snapshot = %crate::short_hex(&s.hash),
                tx = %crate::short_hex(&s.transaction),
                "Transaction already finalized by another snapshot"
            );
            return Ok(());
        }
        if self.store.read_transaction(&s.transaction)?.is_none() {
            let Some(tx) = self.store.cache_get_transaction(&s.transaction)? else {
                tracing::warn!(
                    tx = %crate::short_hex(&s.transaction),
                    "Finalized snapshot for unknown transaction"
                );
                return Ok(());
            };
            // Quorum already decided; take over any conflicting lock
            tx.lock_inputs(self.store.as_ref(), true)?;
            self.store.write_transaction(&tx)?;
        }

        let _state = self.state.lock().await;
        if self.store.read_snapshot(&s.hash)?.is_some() {
            return Ok(());
        }
        let topo = SnapshotWithTopologicalOrder {
            snapshot: s,
            topological_order: self.topo.next(),
        };
        self.store.write_snapshot(&topo).map_err(|e| {
            KernelError::Fatal(format!(
                "persist snapshot {}: {}",
                crate::short_hex(&topo.snapshot.hash),
                e
            ))
        })?;
        tracing::debug!(
            snapshot = %crate::short_hex(&topo.snapshot.hash),
            node = %crate::short_hex(&topo.snapshot.node_id),
            order = topo.topological_order,
            "Recorded peer snapshot"
        );
        Ok(())
    }
}
