//! # Meridian
//!
//! The local-round consensus kernel of a DAG ledger node:
//! - **Per-node rounds**: every node batches its snapshots into numbered,
//!   time-bounded rounds; each new round links to the node's previous round
//!   and to the best closed round of another node, weaving the per-node
//!   chains into one DAG
//! - **Quorum finalization**: a node's snapshot is final once 2/3 + 1 of the
//!   consensus nodes have co-signed it; finalized snapshots receive a global
//!   topological order
//! - **Backpressure**: a node slows its own snapshot production when its
//!   unfinalized snapshots spread too wide in time
//! - **Admission**: externally observed snapshots only enter the local cache
//!   after their transaction passes duplicate, deposit and lock checks

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod node;
pub mod storage;
pub mod transaction;

/// Protocol constants
pub mod constants {
    /// Default duration of a round in nanoseconds (3 seconds).
    pub const SNAPSHOT_ROUND_GAP: u64 = 3_000_000_000;
    /// Number of closed rounds kept per node for external reference selection.
    pub const SNAPSHOT_REFERENCE_THRESHOLD: usize = 10;
    /// Quorum fraction numerator: finalization needs more than num/den of the nodes.
    pub const QUORUM_NUMERATOR: usize = 2;
    /// Quorum fraction denominator.
    pub const QUORUM_DENOMINATOR: usize = 3;
    /// Delay before requeueing a snapshot when the cache pool has no capacity.
    pub const CAPACITY_RETRY_DELAY_MS: u64 = 10;
    /// Interval between clock polls while waiting for a fresh round timestamp.
    pub const TIMESTAMP_POLL_INTERVAL_MS: u64 = 300;
    /// Maximum clock polls before a snapshot is requeued instead of signed.
    pub const TIMESTAMP_MAX_POLLS: u32 = 100;

    /// Current transaction encoding version.
    pub const TX_VERSION: u8 = 1;
    /// Maximum inputs or outputs per transaction.
    pub const MAX_TX_IO: usize = 256;
    /// Maximum size of a transaction's extra field in bytes.
    pub const MAX_EXTRA_SIZE: usize = 256;
    /// Mint group accepted by the structural mint gate.
    pub const MINT_GROUP_UNIVERSAL: &str = "UNIVERSAL";

    /// Maximum network message size (16 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

    /// Chain identifier of Ethereum deposits.
    pub fn ethereum_chain_id() -> crate::Hash {
        crate::hash_domain("meridian.chain", b"ethereum")
    }
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two hashes.
pub fn hash_eq(a: &Hash, b: &Hash) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// Short hex rendering of a hash for log fields.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_NETWORK_MESSAGE_BYTES` to prevent OOM
/// from malicious oversized payloads.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
