//! Admission of externally originated snapshots.

use crate::consensus::snapshot::{NodeId, Snapshot};
use crate::network::{SnapshotMode, Transport};
use crate::storage::RoundStore;
use crate::transaction::SignedTransaction;

use super::{KernelError, Node};

impl<S: RoundStore, T: Transport> Node<S, T> {
    /// Resolve and admit the transaction carried by an external snapshot.
    ///
    /// Returns `None` when the transaction must not (or cannot yet) be
    /// admitted. Validation failures disqualify silently; lock conflicts and
    /// store failures are errors.
    pub fn check_cache_snapshot_transaction(
        &self,
        s: &Snapshot,
    ) -> Result<Option<SignedTransaction>, KernelError> {
        let store = self.store.as_ref();
        if store.check_transaction_in_node(&s.node_id, &s.transaction)? {
            return Ok(None);
        }
        if store.check_transaction_finalization(&s.transaction)? {
            return Ok(None);
        }
        if let Some(tx) = store.read_transaction(&s.transaction)? {
            return Ok(Some(tx));
        }
        let Some(tx) = store.cache_get_transaction(&s.transaction)? else {
            return Ok(None);
        };
        if !crate::hash_eq(&tx.hash(), &s.transaction) {
            return Ok(None);
        }

        if tx.check_mint() {
            if let Err(e) = tx.validate_mint(store) {
                tracing::debug!(tx = %crate::short_hex(&s.transaction), "Mint rejected: {}", e);
                return Ok(None);
            }
        }
        if let Err(e) = tx.validate(store) {
            tracing::debug!(tx = %crate::short_hex(&s.transaction), "Transaction rejected: {}", e);
            return Ok(None);
        }
        tx.lock_inputs(store, false)?;
        store.write_transaction(&tx)?;
        Ok(Some(tx))
    }

    /// Co-sign a peer's self snapshot once its transaction is admitted.
    pub async fn cosign_snapshot(&self, from: NodeId, s: Snapshot) -> Result<(), KernelError> {
        if s.node_id != from {
            tracing::debug!(peer = %crate::short_hex(&from), "Dropped relayed signing request");
            return Ok(());
        }
        let Some(author) = self.consensus_node(&from) else {
            return Err(KernelError::UnknownSigner(from));
        };
        if !crate::hash_eq(&s.hash, &s.payload_hash()) || s.signatures.len() != 1 {
            tracing::debug!(peer = %crate::short_hex(&from), "Dropped malformed signing request");
            return Ok(());
        }
        if !author.public_key.verify(&s.hash, &s.signatures[0]) {
            return Err(KernelError::InvalidSignature(from));
        }
        if self.check_cache_snapshot_transaction(&s)?.is_none() {
            return Ok(());
        }

        let mut reply = s;
        reply.signatures = vec![self.keypair.sign(&reply.hash)];
        tracing::debug!(
            snapshot = %crate::short_hex(&reply.hash),
            peer = %crate::short_hex(&from),
            "Co-signed snapshot"
        );
        self.transport
            .send_snapshot_message(&from, &reply, SnapshotMode::Signing)
            .await?;
        Ok(())
    }
}
