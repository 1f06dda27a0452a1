//! Self-snapshot signing and round rotation.

use crate::consensus::graph::SelectionError;
use crate::consensus::quorum::PendingSnapshot;
use crate::consensus::round::{CacheRound, FinalRound};
use crate::consensus::snapshot::RoundLink;
use crate::network::{SnapshotMode, Transport};
use crate::storage::RoundStore;

use super::{KernelError, KernelState, Node, QueuedSnapshot};

/// Result of trying to close the local round.
enum Rotation {
    Rotated {
        closed: FinalRound,
        stale: Vec<PendingSnapshot>,
    },
    /// No peer round is eligible yet; try again later.
    Deferred,
}

impl<S: RoundStore, T: Transport> Node<S, T> {
    /// Sign one queued snapshot of the local node into its open round.
    ///
    /// Capacity, synchronization and clock conditions that are not met yet
    /// requeue the snapshot after a delay instead of failing.
    pub async fn sign_self_snapshot(&self, item: QueuedSnapshot) -> Result<(), KernelError> {
        let QueuedSnapshot {
            mut snapshot,
            transaction,
        } = item;
        if snapshot.node_id != self.id {
            return Err(KernelError::Invariant("self snapshot from another node"));
        }
        if !snapshot.is_unsigned_shell() {
            return Err(KernelError::Invariant("self snapshot already signed"));
        }
        if snapshot.transaction != transaction.hash() {
            return Err(KernelError::Invariant("self snapshot transaction mismatch"));
        }
        let gap = self.config.snapshot_round_gap;

        let has_capacity = {
            let state = self.state.lock().await;
            state.cache_pool.check_capacity(self.clock.now(), gap)
        };
        if !has_capacity {
            tracing::debug!("Cache pool full, delaying snapshot");
            tokio::time::sleep(self.config.capacity_retry_delay()).await;
            self.requeue(snapshot, transaction);
            return Ok(());
        }

        let (synced, has_snapshots) = {
            let state = self.state.lock().await;
            (
                state.graph.check_sync(self.nodes.iter().map(|n| &n.id)),
                !state.graph.cache_round().snapshots.is_empty(),
            )
        };
        if !synced && !has_snapshots {
            tracing::debug!("Not synchronized with peers, delaying snapshot");
            tokio::time::sleep(self.config.sync_retry_delay()).await;
            self.requeue(snapshot, transaction);
            return Ok(());
        }

        if !self.wait_for_fresh_timestamp().await {
            tracing::warn!(
                polls = self.config.timestamp_max_polls,
                "Clock did not pass round timestamp, requeueing snapshot"
            );
            self.requeue(snapshot, transaction);
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if now <= state.graph.cache_round().timestamp {
            drop(state);
            self.requeue(snapshot, transaction);
            return Ok(());
        }

        let mut rotated = None;
        if let Some((start, _)) = state.graph.cache_round().gap() {
            if now >= start.saturating_add(gap) {
                match self.rotate_round(&mut state, now)? {
                    Rotation::Rotated { closed, stale } => rotated = Some((closed, stale)),
                    Rotation::Deferred => {
                        drop(state);
                        tracing::debug!("No eligible peer round, delaying rotation");
                        tokio::time::sleep(self.config.capacity_retry_delay()).await;
                        self.requeue(snapshot, transaction);
                        return Ok(());
                    }
                }
            }
        }

        let cache = state.graph.cache_round_mut();
        snapshot.round_number = cache.number;
        snapshot.references = cache.references;
        snapshot.timestamp = now;
        cache.timestamp = now;
        snapshot.hash = snapshot.payload_hash();
        let signature = self.keypair.sign(&snapshot.hash);
        snapshot.signatures = vec![signature.clone()];

        state
            .pool
            .open(snapshot.clone(), transaction.clone(), self.id, signature);
        state.cache_pool.push(snapshot.clone());
        drop(state);

        tracing::debug!(
            snapshot = %crate::short_hex(&snapshot.hash),
            round = snapshot.round_number,
            "Signed self snapshot"
        );

        if let Some((closed, stale)) = rotated {
            for pending in stale {
                self.requeue(pending.snapshot, pending.transaction);
            }
            if let Err(e) = self
                .broadcast(|peer| self.transport.send_round_message(peer, &closed))
                .await
            {
                tracing::warn!(round = closed.number, "Round announcement incomplete: {}", e);
            }
        }

        let (snapshot, transaction) = (&snapshot, &transaction);
        self.broadcast(|peer| async move {
            self.transport.send_transaction_message(peer, transaction).await?;
            self.transport
                .send_snapshot_message(peer, snapshot, SnapshotMode::Signing)
                .await
        })
        .await
    }

    /// Poll the clock until it passes the open round's timestamp.
    ///
    /// Returns `false` once the poll budget is spent.
    async fn wait_for_fresh_timestamp(&self) -> bool {
        for _ in 0..=self.config.timestamp_max_polls {
            let round_timestamp = self.state.lock().await.graph.cache_round().timestamp;
            if self.clock.now() > round_timestamp {
                return true;
            }
            tokio::time::sleep(self.config.timestamp_poll_interval()).await;
        }
        false
    }

    /// Freeze the open round and open its successor.
    ///
    /// The new round is persisted before it is used; failing to persist is
    /// fatal. Snapshots still pending from the closed round are handed back
    /// for re-signing.
    fn rotate_round(&self, state: &mut KernelState, now: u64) -> Result<Rotation, KernelError> {
        let gap = self.config.snapshot_round_gap;
        let closed = state
            .graph
            .cache_round()
            .as_final()
            .ok_or(KernelError::Invariant("rotating a round without snapshots"))?;
        let best = match state.graph.select_best_round(now, gap) {
            Ok(round) => round,
            Err(SelectionError::NoEligibleRound) => return Ok(Rotation::Deferred),
            Err(SelectionError::NoPeerRounds) => {
                return Err(KernelError::Fatal("no peer rounds to reference".into()))
            }
        };

        let number = closed.number + 1;
        let references = RoundLink {
            self_ref: closed.hash,
            external: best.hash,
        };
        self.store
            .start_new_round(&self.id, number, &references, closed.start)
            .map_err(|e| KernelError::Fatal(format!("persist round {}: {}", number, e)))?;

        let stale = state.pool.drain();
        state.cache_pool.clear();
        state
            .graph
            .rotate(closed.clone(), CacheRound::new(self.id, number, references));

        tracing::info!(
            round = number,
            closed = %crate::short_hex(&closed.hash),
            external = %crate::short_hex(&best.hash),
            requeued = stale.len(),
            "Rotated round"
        );
        Ok(Rotation::Rotated { closed, stale })
    }
}
