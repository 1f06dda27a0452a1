//! Peer transport.
//!
//! The kernel talks to peers through the [`Transport`] trait. The
//! [`ChannelTransport`] implementation connects in-process nodes over tokio
//! channels, carrying each message in its wire encoding.

pub mod protocol;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use protocol::{decode_message, encode_message, Message, NetworkError, SnapshotMode};

use crate::consensus::round::FinalRound;
use crate::consensus::snapshot::{NodeId, Snapshot};
use crate::transaction::SignedTransaction;

/// Errors from sending to a peer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown peer {}", crate::short_hex(.0))]
    UnknownPeer(NodeId),
    #[error("peer {} disconnected", crate::short_hex(.0))]
    Disconnected(NodeId),
    #[error(transparent)]
    Encoding(#[from] NetworkError),
}

/// Outbound messaging used by the kernel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_snapshot_message(
        &self,
        peer: &NodeId,
        snapshot: &Snapshot,
        mode: SnapshotMode,
    ) -> Result<(), TransportError>;

    async fn send_transaction_message(
        &self,
        peer: &NodeId,
        tx: &SignedTransaction,
    ) -> Result<(), TransportError>;

    async fn send_round_message(&self, peer: &NodeId, round: &FinalRound)
        -> Result<(), TransportError>;
}

/// An encoded message and its sender.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn decode(&self) -> Option<Message> {
        decode_message(&self.payload)
    }
}

/// In-process transport: one inbound channel per node.
#[derive(Clone)]
pub struct ChannelTransport {
    our_id: NodeId,
    peers: HashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
}

impl ChannelTransport {
    /// Fully connected transports for `ids`, each with its inbound receiver.
    pub fn mesh(ids: &[NodeId]) -> Vec<(ChannelTransport, mpsc::UnboundedReceiver<Envelope>)> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::with_capacity(ids.len());
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(*id, tx);
            receivers.push((*id, rx));
        }
        receivers
            .into_iter()
            .map(|(id, rx)| {
                let transport = ChannelTransport {
                    our_id: id,
                    peers: senders.clone(),
                };
                (transport, rx)
            })
            .collect()
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    fn send(&self, peer: &NodeId, msg: &Message) -> Result<(), TransportError> {
        let sender = self
            .peers
            .get(peer)
            .ok_or(TransportError::UnknownPeer(*peer))?;
        let payload = encode_message(msg)?;
        sender
            .send(Envelope {
                from: self.our_id,
                payload,
            })
            .map_err(|_| TransportError::Disconnected(*peer))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_snapshot_message(
        &self,
        peer: &NodeId,
        snapshot: &Snapshot,
        mode: SnapshotMode,
    ) -> Result<(), TransportError> {
        self.send(
            peer,
            &Message::Snapshot {
                snapshot: snapshot.clone(),
                mode,
            },
        )
    }

    async fn send_transaction_message(
        &self,
        peer: &NodeId,
        tx: &SignedTransaction,
    ) -> Result<(), TransportError> {
        self.send(peer, &Message::Transaction(tx.clone()))
    }

    async fn send_round_message(
        &self,
        peer: &NodeId,
        round: &FinalRound,
    ) -> Result<(), TransportError> {
        self.send(peer, &Message::FinalRound(round.clone()))
    }
}
