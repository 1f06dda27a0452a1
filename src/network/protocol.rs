//! Network protocol message definitions for Meridian peer communication.
//!
//! Defines the wire messages exchanged between consensus nodes and their
//! length-prefixed encoding.

use serde::{Deserialize, Serialize};

use crate::consensus::round::FinalRound;
use crate::consensus::snapshot::Snapshot;
use crate::transaction::SignedTransaction;

/// Purpose of a snapshot message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SnapshotMode {
    /// Author soliciting co-signatures, or a co-signer replying with one.
    Signing = 0,
    /// Quorum reached; the snapshot carries its full signature set.
    Finalized = 1,
}

/// Network protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// A transaction a snapshot is about to reference
    Transaction(SignedTransaction),

    /// A snapshot in one of its two exchange modes
    Snapshot { snapshot: Snapshot, mode: SnapshotMode },

    /// A round the sender just closed
    FinalRound(FinalRound),
}

/// Errors from message encoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
}

/// Size-limited bincode config used for both serialization and deserialization.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Serialize a message to bytes (length-prefixed).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serde::encode_to_vec(msg, bincode_config())
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a length-prefixed message.
///
/// Rejects messages whose declared length exceeds `MAX_NETWORK_MESSAGE_BYTES`.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (msg, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(msg)
}
