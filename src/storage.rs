//! Persistent storage for round and ledger data.
//!
//! Provides a `RoundStore` trait and a sled-backed implementation for
//! persisting finalized snapshots, round progress, transactions, input locks
//! and the deposit domain list.

use serde::{Deserialize, Serialize};

use crate::consensus::snapshot::{NodeId, RoundLink, Snapshot, SnapshotWithTopologicalOrder};
use crate::crypto::keys::SigningPublicKey;
use crate::transaction::{Input, SignedTransaction};
use crate::Hash;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from input locking.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LockError {
    #[error("input {} already locked by {}", hex::encode(.input), hex::encode(.holder))]
    Conflict { input: Hash, holder: Hash },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An external validator key allowed to attest deposits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub public_spend_key: SigningPublicKey,
}

/// Persisted progress of a node's rounds.
///
/// `references.self_ref` is the hash of round `number - 1`, whose start was
/// `final_start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMeta {
    pub number: u64,
    pub references: RoundLink,
    pub final_start: u64,
}

/// Trait for persistent storage backends.
pub trait RoundStore: Send + Sync {
    fn read_transaction(&self, hash: &Hash) -> Result<Option<SignedTransaction>, StorageError>;
    /// Store a validated transaction and drop its cached copy. Mint
    /// transactions also advance the recorded mint batch.
    fn write_transaction(&self, tx: &SignedTransaction) -> Result<(), StorageError>;

    /// Transactions seen on the network but not validated yet.
    fn cache_get_transaction(&self, hash: &Hash)
        -> Result<Option<SignedTransaction>, StorageError>;
    fn cache_put_transaction(&self, tx: &SignedTransaction) -> Result<(), StorageError>;

    /// Whether `tx` was already finalized in a snapshot of `node_id`.
    fn check_transaction_in_node(&self, node_id: &NodeId, tx: &Hash) -> Result<bool, StorageError>;
    /// Whether `tx` was finalized by any node.
    fn check_transaction_finalization(&self, tx: &Hash) -> Result<bool, StorageError>;

    fn write_snapshot(&self, snapshot: &SnapshotWithTopologicalOrder) -> Result<(), StorageError>;
    fn read_snapshot(&self, hash: &Hash)
        -> Result<Option<SnapshotWithTopologicalOrder>, StorageError>;
    /// Finalized snapshots of one round of one node, in topological order.
    fn read_round_snapshots(&self, node_id: &NodeId, number: u64)
        -> Result<Vec<Snapshot>, StorageError>;
    /// Number of finalized snapshots.
    fn topology_count(&self) -> Result<u64, StorageError>;

    fn start_new_round(
        &self,
        node_id: &NodeId,
        number: u64,
        references: &RoundLink,
        final_start: u64,
    ) -> Result<(), StorageError>;
    fn read_round(&self, node_id: &NodeId) -> Result<Option<RoundMeta>, StorageError>;

    fn read_domains(&self) -> Result<Vec<Domain>, StorageError>;
    fn put_domain(&self, domain: &Domain) -> Result<(), StorageError>;

    /// Lock `input` to transaction `tx`.
    ///
    /// Relocking by the same transaction succeeds; a different holder is a
    /// conflict unless `force` is set.
    fn lock_input(&self, input: &Hash, tx: &Hash, force: bool) -> Result<(), LockError>;

    fn read_last_mint_batch(&self) -> Result<Option<u64>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// Sled-backed storage implementation.
pub struct SledStore {
    db: sled::Db,
    transactions: sled::Tree,
    tx_cache: sled::Tree,
    snapshots: sled::Tree,
    topology: sled::Tree,
    round_index: sled::Tree,
    rounds: sled::Tree,
    finalization: sled::Tree,
    node_transactions: sled::Tree,
    locks: sled::Tree,
    domains: sled::Tree,
    meta: sled::Tree,
    topology_count: std::sync::atomic::AtomicU64,
}

const LAST_MINT_BATCH_KEY: &[u8] = b"last_mint_batch";

impl SledStore {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let tree = |name: &str| db.open_tree(name).map_err(|e| StorageError::Io(e.to_string()));
        let transactions = tree("transactions")?;
        let tx_cache = tree("tx_cache")?;
        let snapshots = tree("snapshots")?;
        let topology = tree("topology")?;
        let round_index = tree("round_index")?;
        let rounds = tree("rounds")?;
        let finalization = tree("finalization")?;
        let node_transactions = tree("node_transactions")?;
        let locks = tree("locks")?;
        let domains = tree("domains")?;
        let meta = tree("meta")?;
        let topology_count = std::sync::atomic::AtomicU64::new(topology.len() as u64);
        Ok(SledStore {
            db,
            transactions,
            tx_cache,
            snapshots,
            topology,
            round_index,
            rounds,
            finalization,
            node_transactions,
            locks,
            domains,
            meta,
            topology_count,
        })
    }

    fn read_tx_from(
        tree: &sled::Tree,
        hash: &Hash,
    ) -> Result<Option<SignedTransaction>, StorageError> {
        match tree.get(hash).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(bytes) => {
                let tx = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }
}

/// `node_id || tx`, marking a transaction finalized in a node's snapshot.
fn node_tx_key(node_id: &NodeId, tx: &Hash) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(node_id);
    key[32..].copy_from_slice(tx);
    key
}

/// `node_id || round (BE) || topological order (BE)`; sled's lexicographic
/// order then lists a round's snapshots in ledger order.
fn round_snapshot_key(node_id: &NodeId, number: u64, order: u64) -> [u8; 48] {
    let mut key = [0u8; 48];
    key[..32].copy_from_slice(node_id);
    key[32..40].copy_from_slice(&number.to_be_bytes());
    key[40..].copy_from_slice(&order.to_be_bytes());
    key
}

impl RoundStore for SledStore {
    fn read_transaction(&self, hash: &Hash) -> Result<Option<SignedTransaction>, StorageError> {
        Self::read_tx_from(&self.transactions, hash)
    }

    fn write_transaction(&self, tx: &SignedTransaction) -> Result<(), StorageError> {
        let value = crate::serialize(tx).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let hash = tx.hash();
        self.transactions
            .insert(hash, value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.tx_cache
            .remove(hash)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        if let Some(Input::Mint(mint)) = tx.transaction.inputs.first() {
            let last = self.read_last_mint_batch()?;
            if last.map_or(true, |l| mint.batch > l) {
                self.meta
                    .insert(LAST_MINT_BATCH_KEY, &mint.batch.to_be_bytes())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn cache_get_transaction(
        &self,
        hash: &Hash,
    ) -> Result<Option<SignedTransaction>, StorageError> {
        Self::read_tx_from(&self.tx_cache, hash)
    }

    fn cache_put_transaction(&self, tx: &SignedTransaction) -> Result<(), StorageError> {
        let value = crate::serialize(tx).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.tx_cache
            .insert(tx.hash(), value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn check_transaction_in_node(&self, node_id: &NodeId, tx: &Hash) -> Result<bool, StorageError> {
        self.node_transactions
            .contains_key(node_tx_key(node_id, tx))
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn check_transaction_finalization(&self, tx: &Hash) -> Result<bool, StorageError> {
        self.finalization
            .contains_key(tx)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn write_snapshot(&self, topo: &SnapshotWithTopologicalOrder) -> Result<(), StorageError> {
        let s = &topo.snapshot;
        let fresh = !self
            .snapshots
            .contains_key(s.hash)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let value =
            crate::serialize(topo).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut snap_batch = sled::Batch::default();
        snap_batch.insert(&s.hash[..], value);

        // Use big-endian so sled's lexicographic order matches numeric order
        let mut topo_batch = sled::Batch::default();
        topo_batch.insert(&topo.topological_order.to_be_bytes()[..], &s.hash[..]);

        let mut round_batch = sled::Batch::default();
        round_batch.insert(
            &round_snapshot_key(&s.node_id, s.round_number, topo.topological_order)[..],
            &s.hash[..],
        );

        let mut fin_batch = sled::Batch::default();
        fin_batch.insert(&s.transaction[..], &s.hash[..]);

        let mut node_batch = sled::Batch::default();
        node_batch.insert(&node_tx_key(&s.node_id, &s.transaction)[..], &s.hash[..]);

        // The topology entry goes last: reopening counts it, so it must not
        // exist without the snapshot it orders.
        self.snapshots
            .apply_batch(snap_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.round_index
            .apply_batch(round_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.finalization
            .apply_batch(fin_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.node_transactions
            .apply_batch(node_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.topology
            .apply_batch(topo_batch)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        // Finalization must be durable before peers learn of it
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;

        if fresh {
            self.topology_count
                .fetch_add(1, std::sync::atomic::Ordering::Release);
        }
        Ok(())
    }

    fn read_snapshot(
        &self,
        hash: &Hash,
    ) -> Result<Option<SnapshotWithTopologicalOrder>, StorageError> {
        match self
            .snapshots
            .get(hash)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let snapshot = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn read_round_snapshots(
        &self,
        node_id: &NodeId,
        number: u64,
    ) -> Result<Vec<Snapshot>, StorageError> {
        let mut prefix = [0u8; 40];
        prefix[..32].copy_from_slice(node_id);
        prefix[32..].copy_from_slice(&number.to_be_bytes());

        let mut results = Vec::new();
        for entry in self.round_index.scan_prefix(prefix) {
            let (_, hash_bytes) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let hash: Hash = hash_bytes
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Serialization("bad snapshot hash".into()))?;
            if let Some(topo) = self.read_snapshot(&hash)? {
                results.push(topo.snapshot);
            }
        }
        Ok(results)
    }

    fn topology_count(&self) -> Result<u64, StorageError> {
        Ok(self
            .topology_count
            .load(std::sync::atomic::Ordering::Acquire))
    }

    fn start_new_round(
        &self,
        node_id: &NodeId,
        number: u64,
        references: &RoundLink,
        final_start: u64,
    ) -> Result<(), StorageError> {
        let meta = RoundMeta {
            number,
            references: *references,
            final_start,
        };
        let value =
            crate::serialize(&meta).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.rounds
            .insert(node_id, value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        // Rotation must be durable before the new round is used
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn read_round(&self, node_id: &NodeId) -> Result<Option<RoundMeta>, StorageError> {
        match self
            .rounds
            .get(node_id)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let meta = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    fn read_domains(&self) -> Result<Vec<Domain>, StorageError> {
        let mut results = Vec::new();
        for entry in self.domains.iter() {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let domain: Domain = crate::deserialize(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            results.push(domain);
        }
        Ok(results)
    }

    fn put_domain(&self, domain: &Domain) -> Result<(), StorageError> {
        let value =
            crate::serialize(domain).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.domains
            .insert(domain.public_spend_key.fingerprint(), value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn lock_input(&self, input: &Hash, tx: &Hash, force: bool) -> Result<(), LockError> {
        loop {
            let current = self
                .locks
                .get(input)
                .map_err(|e| StorageError::Io(e.to_string()))?;
            if let Some(holder) = &current {
                if holder.as_ref() == &tx[..] {
                    return Ok(());
                }
                if !force {
                    let holder: Hash = holder
                        .as_ref()
                        .try_into()
                        .map_err(|_| StorageError::Serialization("bad lock holder".into()))?;
                    return Err(LockError::Conflict {
                        input: *input,
                        holder,
                    });
                }
            }
            let swapped = self
                .locks
                .compare_and_swap(input, current, Some(&tx[..]))
                .map_err(|e| StorageError::Io(e.to_string()))?;
            if swapped.is_ok() {
                return Ok(());
            }
            // Lost a race with another locker; re-read the holder
        }
    }

    fn read_last_mint_batch(&self) -> Result<Option<u64>, StorageError> {
        match self
            .meta
            .get(LAST_MINT_BATCH_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Serialization("bad mint batch".into()))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}
