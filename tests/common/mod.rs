//! Shared harness: an in-process cluster driven step by step.
//!
//! Nothing runs in the background. Tests sign queued snapshots with
//! [`Cluster::sign`] and deliver messages with [`Cluster::pump`], so every
//! interleaving is deterministic.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use meridian::config::ConsensusConfig;
use meridian::consensus::{ConsensusNode, NodeId, Snapshot};
use meridian::crypto::keys::SigningKeypair;
use meridian::network::{ChannelTransport, Envelope};
use meridian::node::{Clock, ManualClock, Node, QueuedSnapshot};
use meridian::storage::{Domain, RoundStore, SledStore};
use meridian::transaction::deposit::DepositData;
use meridian::transaction::mint::MintData;
use meridian::transaction::{SignedTransaction, Transaction};
use meridian::Hash;

pub const GENESIS: u64 = 1_000_000_000;
pub const GAP: u64 = 1_000_000;

pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        snapshot_round_gap: GAP,
        capacity_retry_delay_ms: 0,
        timestamp_poll_interval_ms: 0,
        timestamp_max_polls: 1,
        genesis_timestamp: GENESIS,
        ..ConsensusConfig::default()
    }
}

pub struct Cluster {
    pub keypairs: Vec<SigningKeypair>,
    pub ids: Vec<NodeId>,
    pub nodes: Vec<Node<SledStore, ChannelTransport>>,
    pub queues: Vec<UnboundedReceiver<QueuedSnapshot>>,
    pub inboxes: Vec<UnboundedReceiver<Envelope>>,
    pub clock: Arc<ManualClock>,
}

impl Cluster {
    /// `n` nodes on temporary stores.
    pub fn new(n: usize) -> Self {
        let stores = (0..n)
            .map(|_| Arc::new(SledStore::open_temporary().unwrap()))
            .collect();
        let keypairs = (0..n).map(|_| SigningKeypair::generate()).collect();
        Self::with_stores(keypairs, stores, test_config())
    }

    pub fn with_stores(
        keypairs: Vec<SigningKeypair>,
        stores: Vec<Arc<SledStore>>,
        config: ConsensusConfig,
    ) -> Self {
        let consensus: Vec<ConsensusNode> = keypairs
            .iter()
            .map(|kp| ConsensusNode::new(kp.public.clone()))
            .collect();
        let ids: Vec<NodeId> = consensus.iter().map(|n| n.id).collect();
        let clock = Arc::new(ManualClock::new(GENESIS + GAP));

        let mut nodes = Vec::new();
        let mut queues = Vec::new();
        let mut inboxes = Vec::new();
        for ((kp, store), (transport, inbox)) in keypairs
            .iter()
            .zip(stores)
            .zip(ChannelTransport::mesh(&ids))
        {
            let (node, queue) = Node::new(
                kp.clone(),
                consensus.clone(),
                config.clone(),
                store,
                transport,
                clock.clone() as Arc<dyn Clock>,
            )
            .unwrap();
            nodes.push(node);
            queues.push(queue);
            inboxes.push(inbox);
        }

        Cluster {
            keypairs,
            ids,
            nodes,
            queues,
            inboxes,
            clock,
        }
    }

    /// Register `domain` as a deposit signer on every node.
    pub fn add_domain(&self, domain: &SigningKeypair) {
        for node in &self.nodes {
            node.store()
                .put_domain(&Domain {
                    public_spend_key: domain.public.clone(),
                })
                .unwrap();
        }
    }

    /// Sign the next queued snapshot of node `i`.
    pub async fn sign(&mut self, i: usize) {
        self.clock.advance(1);
        let item = self.queues[i].try_recv().expect("queued snapshot");
        self.nodes[i].sign_self_snapshot(item).await.unwrap();
    }

    /// Deliver messages until every inbox is empty.
    pub async fn pump(&mut self) {
        loop {
            let mut delivered = false;
            for i in 0..self.nodes.len() {
                while let Ok(envelope) = self.inboxes[i].try_recv() {
                    delivered = true;
                    let message = envelope.decode().expect("well-formed message");
                    self.nodes[i]
                        .handle_message(envelope.from, message)
                        .await
                        .unwrap();
                }
            }
            if !delivered {
                break;
            }
        }
    }

    /// Submit, sign and settle one transaction authored by node `i`.
    pub async fn finalize(&mut self, i: usize, tx: SignedTransaction) -> Snapshot {
        let hash = self.nodes[i].submit_transaction(tx).unwrap();
        self.sign(i).await;
        self.pump().await;
        self.nodes[i]
            .cache_round()
            .await
            .snapshots
            .into_iter()
            .find(|s| s.transaction == hash)
            .expect("snapshot finalized into the open round")
    }

    /// Take everything waiting in node `i`'s snapshot queue.
    pub fn drain_queue(&mut self, i: usize) -> Vec<QueuedSnapshot> {
        let mut items = Vec::new();
        while let Ok(item) = self.queues[i].try_recv() {
            items.push(item);
        }
        items
    }
}

pub fn asset() -> Hash {
    meridian::hash_domain("meridian.test.asset", b"XIN")
}

pub fn mint(batch: u64, amount: u64) -> SignedTransaction {
    let mut tx = Transaction::new(asset());
    tx.add_mint_input(MintData {
        group: meridian::constants::MINT_GROUP_UNIVERSAL.into(),
        batch,
        amount,
    });
    tx.add_output(amount, [1u8; 32]);
    SignedTransaction::new(tx)
}

pub fn deposit(domain: &SigningKeypair, output_index: u64, recipient: Hash) -> SignedTransaction {
    let data = DepositData {
        chain: meridian::constants::ethereum_chain_id(),
        asset_key: "0xdac17f958d2ee523a2206206994597c13d831ec7".into(),
        transaction_hash: format!("0x{}", "cd".repeat(32)),
        output_index,
        amount: 700,
    };
    let mut tx = Transaction::new(data.asset_id());
    tx.add_deposit_input(data);
    tx.add_output(700, recipient);
    let mut signed = SignedTransaction::new(tx);
    signed.sign_input(domain);
    signed
}
