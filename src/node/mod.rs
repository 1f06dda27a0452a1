//! Node kernel tying together round state, storage and the peer transport.
//!
//! The `Node` owns the lock-guarded [`KernelState`] and runs two loops:
//! [`Node::run`] drains the local snapshot queue through the signer, and
//! [`Node::serve`] dispatches inbound peer messages to admission, signature
//! aggregation and round gossip.

pub mod admission;
pub mod aggregator;
pub mod clock;
pub mod signer;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ConsensusConfig};
use crate::consensus::backpressure::CachePool;
use crate::consensus::graph::{RoundError, RoundGraph};
use crate::consensus::quorum::{ConsensusNode, SignaturePool};
use crate::consensus::round::{CacheRound, FinalRound};
use crate::consensus::snapshot::{NodeId, RoundLink, Snapshot};
use crate::consensus::topo::TopoCounter;
use crate::crypto::keys::SigningKeypair;
use crate::network::{Envelope, Message, SnapshotMode, Transport, TransportError};
use crate::storage::{LockError, RoundStore, StorageError};
use crate::transaction::{SignedTransaction, TxValidationError};
use crate::Hash;

pub use clock::{Clock, ManualClock, SystemClock};

/// Round state shared by the signer, the aggregator and message handling.
pub struct KernelState {
    pub graph: RoundGraph,
    pub pool: SignaturePool,
    pub cache_pool: CachePool,
}

/// An unsigned snapshot waiting for the signer, with its transaction.
#[derive(Clone, Debug)]
pub struct QueuedSnapshot {
    pub snapshot: Snapshot,
    pub transaction: SignedTransaction,
}

/// Kernel errors.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("rejected: {0}")]
    Rejected(#[from] TxValidationError),
    #[error("invalid signature from {}", crate::short_hex(.0))]
    InvalidSignature(NodeId),
    #[error("unknown signer {}", crate::short_hex(.0))]
    UnknownSigner(NodeId),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KernelError {
    /// Whether the kernel must halt instead of continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::Invariant(_) | KernelError::Fatal(_))
    }
}

/// The round kernel of one consensus node.
pub struct Node<S, T> {
    keypair: SigningKeypair,
    id: NodeId,
    nodes: Vec<ConsensusNode>,
    config: ConsensusConfig,
    store: Arc<S>,
    transport: T,
    clock: Arc<dyn Clock>,
    state: Mutex<KernelState>,
    topo: TopoCounter,
    queue: mpsc::UnboundedSender<QueuedSnapshot>,
}

impl<S: RoundStore, T: Transport> Node<S, T> {
    /// Build a node and restore its round state from `store`.
    ///
    /// Every consensus node's round 0 is installed as a genesis round. On a
    /// fresh store the local node opens round 1 on top of its own genesis
    /// round and the genesis round of the lowest other node id.
    pub fn new(
        keypair: SigningKeypair,
        nodes: Vec<ConsensusNode>,
        config: ConsensusConfig,
        store: Arc<S>,
        transport: T,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<QueuedSnapshot>), KernelError> {
        config.validate()?;
        let id = keypair.public.fingerprint();
        if !nodes.iter().any(|n| n.id == id) {
            return Err(KernelError::Invariant("local node is not a consensus node"));
        }
        let gap = config.snapshot_round_gap;

        let meta = store.read_round(&id)?;
        let cache = match &meta {
            Some(meta) => {
                let mut cache = CacheRound::new(id, meta.number, meta.references);
                for s in store.read_round_snapshots(&id, meta.number)? {
                    if !cache.validate_snapshot(&s, true, gap) {
                        return Err(KernelError::Invariant(
                            "stored snapshot rejected by its round",
                        ));
                    }
                }
                cache
            }
            None => {
                let external = nodes
                    .iter()
                    .map(|n| n.id)
                    .filter(|n| *n != id)
                    .min()
                    .unwrap_or(id);
                let references = RoundLink {
                    self_ref: FinalRound::genesis(id, config.genesis_timestamp).hash,
                    external: FinalRound::genesis(external, config.genesis_timestamp).hash,
                };
                store.start_new_round(&id, 1, &references, config.genesis_timestamp)?;
                CacheRound::new(id, 1, references)
            }
        };

        let mut graph = RoundGraph::new(cache, config.snapshot_reference_threshold);
        for n in &nodes {
            graph.seed_final_round(FinalRound::genesis(n.id, config.genesis_timestamp));
        }
        if let Some(meta) = meta.filter(|m| m.number > 1) {
            graph.seed_final_round(FinalRound {
                node_id: id,
                number: meta.number - 1,
                start: meta.final_start,
                hash: meta.references.self_ref,
            });
        }

        let topo = TopoCounter::new(store.topology_count()?);
        tracing::info!(
            node = %crate::short_hex(&id),
            round = graph.cache_round().number,
            topology = topo.peek(),
            "Kernel state restored"
        );

        let (queue, queue_rx) = mpsc::unbounded_channel();
        let node = Node {
            keypair,
            id,
            nodes,
            config,
            store,
            transport,
            clock,
            state: Mutex::new(KernelState {
                graph,
                pool: SignaturePool::default(),
                cache_pool: CachePool::default(),
            }),
            topo,
            queue,
        };
        Ok((node, queue_rx))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn consensus_nodes(&self) -> &[ConsensusNode] {
        &self.nodes
    }

    /// Next topological order value to be assigned.
    pub fn topology(&self) -> u64 {
        self.topo.peek()
    }

    pub async fn cache_round(&self) -> CacheRound {
        self.state.lock().await.graph.cache_round().clone()
    }

    pub async fn final_round(&self, node_id: &NodeId) -> Option<FinalRound> {
        self.state.lock().await.graph.final_round(node_id).cloned()
    }

    /// Number of self-signed snapshots awaiting quorum.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pool.len()
    }

    fn quorum_threshold(&self) -> usize {
        self.config.quorum_threshold(self.nodes.len())
    }

    fn consensus_node(&self, id: &NodeId) -> Option<&ConsensusNode> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Validate, lock and store a local transaction, then queue a snapshot
    /// for it.
    pub fn submit_transaction(&self, tx: SignedTransaction) -> Result<Hash, KernelError> {
        if tx.check_mint() {
            tx.validate_mint(self.store.as_ref())?;
        }
        tx.validate(self.store.as_ref())?;
        tx.lock_inputs(self.store.as_ref(), false)?;
        self.store.write_transaction(&tx)?;

        let hash = tx.hash();
        tracing::debug!(tx = %crate::short_hex(&hash), "Queued transaction");
        self.enqueue(Snapshot::new(self.id, hash), tx);
        Ok(hash)
    }

    fn enqueue(&self, snapshot: Snapshot, transaction: SignedTransaction) {
        if self
            .queue
            .send(QueuedSnapshot {
                snapshot,
                transaction,
            })
            .is_err()
        {
            tracing::warn!("Snapshot queue closed, dropping snapshot");
        }
    }

    /// Return a snapshot to the queue as an unsigned shell.
    fn requeue(&self, mut snapshot: Snapshot, transaction: SignedTransaction) {
        snapshot.reset();
        self.enqueue(snapshot, transaction);
    }

    /// Send `msg` to every consensus peer. All peers are attempted; the first
    /// failure is returned.
    async fn broadcast<'a, F, Fut>(&'a self, send: F) -> Result<(), KernelError>
    where
        F: Fn(&'a NodeId) -> Fut,
        Fut: std::future::Future<Output = Result<(), TransportError>>,
    {
        let mut first_err = None;
        for node in &self.nodes {
            if node.id == self.id {
                continue;
            }
            if let Err(e) = send(&node.id).await {
                tracing::warn!(peer = %crate::short_hex(&node.id), "Send failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Route one inbound message.
    pub async fn handle_message(&self, from: NodeId, message: Message) -> Result<(), KernelError> {
        if self.consensus_node(&from).is_none() || from == self.id {
            tracing::debug!(peer = %crate::short_hex(&from), "Dropped message from non-peer");
            return Ok(());
        }
        match message {
            Message::Transaction(tx) => {
                self.store.cache_put_transaction(&tx)?;
                Ok(())
            }
            Message::Snapshot {
                snapshot,
                mode: SnapshotMode::Signing,
            } => {
                if snapshot.node_id == self.id {
                    if snapshot.signatures.len() != 1 {
                        tracing::debug!(
                            peer = %crate::short_hex(&from),
                            "Dropped co-signature with {} signatures",
                            snapshot.signatures.len()
                        );
                        return Ok(());
                    }
                    self.collect_self_signatures(snapshot, from).await
                } else {
                    self.cosign_snapshot(from, snapshot).await
                }
            }
            Message::Snapshot {
                snapshot,
                mode: SnapshotMode::Finalized,
            } => self.accept_finalized_snapshot(snapshot).await,
            Message::FinalRound(round) => {
                if round.node_id != from {
                    tracing::debug!(peer = %crate::short_hex(&from), "Dropped relayed round");
                    return Ok(());
                }
                let number = round.number;
                let mut state = self.state.lock().await;
                match state.graph.update_final_round(round) {
                    Ok(true) => tracing::debug!(
                        peer = %crate::short_hex(&from),
                        round = number,
                        "Peer round closed"
                    ),
                    Ok(false) => {}
                    Err(e @ RoundError::Gap { .. }) => tracing::warn!(
                        peer = %crate::short_hex(&from),
                        "Rejected round: {}; peer history frozen until resync",
                        e
                    ),
                    Err(e) => tracing::debug!(peer = %crate::short_hex(&from), "Rejected round: {}", e),
                }
                Ok(())
            }
        }
    }

    /// Drain the local snapshot queue until `shutdown` fires or a fatal
    /// error halts the kernel.
    pub async fn run(
        &self,
        mut queue: mpsc::UnboundedReceiver<QueuedSnapshot>,
        shutdown: CancellationToken,
    ) -> Result<(), KernelError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received");
                    self.store.flush()?;
                    return Ok(());
                }
                Some(item) = queue.recv() => {
                    if let Err(e) = self.sign_self_snapshot(item).await {
                        if e.is_fatal() {
                            tracing::error!("Halting kernel: {}", e);
                            return Err(e);
                        }
                        tracing::warn!("Self snapshot: {}", e);
                    }
                }
            }
        }
    }

    /// Dispatch inbound envelopes until `shutdown` fires or a fatal error
    /// halts the kernel. Undecodable payloads are discarded.
    pub async fn serve(
        &self,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        shutdown: CancellationToken,
    ) -> Result<(), KernelError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                Some(envelope) = inbox.recv() => {
                    let Some(message) = envelope.decode() else {
                        tracing::debug!(peer = %crate::short_hex(&envelope.from), "Dropped malformed message");
                        continue;
                    };
                    if let Err(e) = self.handle_message(envelope.from, message).await {
                        if e.is_fatal() {
                            tracing::error!("Halting kernel: {}", e);
                            return Err(e);
                        }
                        tracing::debug!(peer = %crate::short_hex(&envelope.from), "Message: {}", e);
                    }
                }
            }
        }
    }
}
