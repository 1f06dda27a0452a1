//! Transaction model carried by snapshots.
//!
//! Every snapshot binds exactly one transaction. A transaction spends one of
//! three kinds of input:
//! - **UTXO**: an output of an earlier transaction, signed by its owner
//! - **Deposit**: value arriving from an external chain, attested by a domain key
//! - **Mint**: protocol issuance, structurally gated only
//!
//! The transaction hash covers the unsigned payload; the same hash is the
//! message every input signature commits to.

pub mod deposit;
pub mod mint;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Signature, SigningKeypair};
use crate::storage::{LockError, RoundStore, StorageError};
use crate::Hash;

pub use deposit::DepositData;
pub use mint::MintData;

/// A transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Input {
    /// Spend output `index` of transaction `hash`.
    Utxo { hash: Hash, index: u64 },
    /// Credit a deposit observed on an external chain.
    Deposit(DepositData),
    /// Protocol issuance.
    Mint(MintData),
}

impl Input {
    /// Key under which this input is locked against double-spend.
    pub fn lock_key(&self) -> Hash {
        match self {
            Input::Utxo { hash, index } => {
                crate::hash_concat(&[b"utxo", hash, &index.to_le_bytes()])
            }
            Input::Deposit(d) => d.unique_key(),
            Input::Mint(m) => {
                crate::hash_concat(&[b"mint", m.group.as_bytes(), &m.batch.to_le_bytes()])
            }
        }
    }
}

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    /// Recipient identifier (opaque to the kernel).
    pub recipient: Hash,
}

/// The unsigned transaction payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub asset: Hash,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub extra: Vec<u8>,
}

impl Transaction {
    pub fn new(asset: Hash) -> Self {
        Transaction {
            version: crate::constants::TX_VERSION,
            asset,
            inputs: Vec::new(),
            outputs: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn add_utxo_input(&mut self, hash: Hash, index: u64) {
        self.inputs.push(Input::Utxo { hash, index });
    }

    pub fn add_deposit_input(&mut self, data: DepositData) {
        self.inputs.push(Input::Deposit(data));
    }

    pub fn add_mint_input(&mut self, data: MintData) {
        self.inputs.push(Input::Mint(data));
    }

    pub fn add_output(&mut self, amount: u64, recipient: Hash) {
        self.outputs.push(Output { amount, recipient });
    }

    /// Payload hash; also the message that input signatures commit to.
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new_derive_key("meridian.transaction");
        hasher.update(&[self.version]);
        hasher.update(&self.asset);
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(&input.lock_key());
            if let Input::Deposit(d) = input {
                hasher.update(&d.amount.to_le_bytes());
            }
            if let Input::Mint(m) = input {
                hasher.update(&m.amount.to_le_bytes());
            }
        }
        hasher.update(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&output.amount.to_le_bytes());
            hasher.update(&output.recipient);
        }
        hasher.update(&(self.extra.len() as u64).to_le_bytes());
        hasher.update(&self.extra);
        *hasher.finalize().as_bytes()
    }

    /// Sum of all output amounts, `None` on overflow.
    pub fn output_total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }
}

/// A transaction with one signature group per input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub signatures: Vec<Vec<Signature>>,
}

impl SignedTransaction {
    pub fn new(transaction: Transaction) -> Self {
        SignedTransaction {
            transaction,
            signatures: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.transaction.hash()
    }

    /// Append a signature group signed by `keypair` over the payload hash.
    pub fn sign_input(&mut self, keypair: &SigningKeypair) {
        let msg = self.transaction.hash();
        self.signatures.push(vec![keypair.sign(&msg)]);
    }

    /// Whether this is a mint transaction (a single mint input).
    pub fn check_mint(&self) -> bool {
        self.transaction.inputs.len() == 1
            && matches!(self.transaction.inputs[0], Input::Mint(_))
    }

    /// General validation against the store.
    ///
    /// Mint transactions only get the shape checks here; their issuance gate
    /// is `validate_mint`.
    pub fn validate<S: RoundStore + ?Sized>(&self, store: &S) -> Result<(), TxValidationError> {
        let tx = &self.transaction;
        if tx.version != crate::constants::TX_VERSION {
            return Err(TxValidationError::InvalidVersion(tx.version));
        }
        if tx.asset == [0u8; 32] {
            return Err(TxValidationError::InvalidAsset);
        }
        if tx.inputs.is_empty() {
            return Err(TxValidationError::NoInputs);
        }
        if tx.outputs.is_empty() {
            return Err(TxValidationError::NoOutputs);
        }
        if tx.inputs.len() > crate::constants::MAX_TX_IO {
            return Err(TxValidationError::TooManyInputs);
        }
        if tx.outputs.len() > crate::constants::MAX_TX_IO {
            return Err(TxValidationError::TooManyOutputs);
        }
        if tx.extra.len() > crate::constants::MAX_EXTRA_SIZE {
            return Err(TxValidationError::ExtraTooLarge(tx.extra.len()));
        }
        if tx.outputs.iter().any(|o| o.amount == 0) {
            return Err(TxValidationError::ZeroAmount);
        }

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if !seen.insert(input.lock_key()) {
                return Err(TxValidationError::DuplicateInput);
            }
        }

        match &tx.inputs[0] {
            Input::Deposit(_) => {
                let msg = tx.hash();
                self.validate_deposit_input(store, &msg)?;
                let total = tx.output_total().ok_or(TxValidationError::AmountOverflow)?;
                if let Input::Deposit(d) = &tx.inputs[0] {
                    if d.amount != total {
                        return Err(TxValidationError::Unbalanced {
                            inputs: d.amount,
                            outputs: total,
                        });
                    }
                }
                Ok(())
            }
            Input::Mint(_) => {
                if tx.inputs.len() != 1 {
                    return Err(TxValidationError::MixedInputs);
                }
                Ok(())
            }
            Input::Utxo { .. } => self.validate_utxo_inputs(store),
        }
    }

    fn validate_utxo_inputs<S: RoundStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<(), TxValidationError> {
        let tx = &self.transaction;
        if self.signatures.len() != tx.inputs.len() {
            return Err(TxValidationError::InvalidSignatureCount(self.signatures.len()));
        }
        if self.signatures.iter().any(|group| group.is_empty()) {
            return Err(TxValidationError::InvalidSignatureCount(0));
        }

        let mut input_total: u64 = 0;
        for input in &tx.inputs {
            let (hash, index) = match input {
                Input::Utxo { hash, index } => (hash, *index),
                _ => return Err(TxValidationError::MixedInputs),
            };
            let source = store
                .read_transaction(hash)?
                .ok_or(TxValidationError::MissingInput(*hash))?;
            if source.transaction.asset != tx.asset {
                return Err(TxValidationError::InvalidAsset);
            }
            let output = source
                .transaction
                .outputs
                .get(index as usize)
                .ok_or(TxValidationError::MissingInput(*hash))?;
            input_total = input_total
                .checked_add(output.amount)
                .ok_or(TxValidationError::AmountOverflow)?;
        }

        let output_total = tx.output_total().ok_or(TxValidationError::AmountOverflow)?;
        if input_total != output_total {
            return Err(TxValidationError::Unbalanced {
                inputs: input_total,
                outputs: output_total,
            });
        }
        Ok(())
    }

    /// Lock every input to this transaction.
    ///
    /// Without `force`, an input already locked by a different transaction is a
    /// conflict. Relocking by the same transaction is a no-op.
    pub fn lock_inputs<S: RoundStore + ?Sized>(
        &self,
        store: &S,
        force: bool,
    ) -> Result<(), LockError> {
        let hash = self.hash();
        for input in &self.transaction.inputs {
            store.lock_input(&input.lock_key(), &hash, force)?;
        }
        Ok(())
    }
}

/// Transaction validation failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxValidationError {
    #[error("invalid transaction version {0}")]
    InvalidVersion(u8),
    #[error("invalid asset")]
    InvalidAsset,
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("too many inputs")]
    TooManyInputs,
    #[error("too many outputs")]
    TooManyOutputs,
    #[error("extra too large: {0} bytes")]
    ExtraTooLarge(usize),
    #[error("output amount must be positive")]
    ZeroAmount,
    #[error("amount overflow")]
    AmountOverflow,
    #[error("duplicate input")]
    DuplicateInput,
    #[error("deposit, mint and utxo inputs cannot be mixed")]
    MixedInputs,
    #[error("input transaction not found: {}", hex::encode(.0))]
    MissingInput(Hash),
    #[error("inputs {inputs} do not balance outputs {outputs}")]
    Unbalanced { inputs: u64, outputs: u64 },
    #[error("invalid inputs count {0} for deposit")]
    InvalidDepositInputCount(usize),
    #[error("invalid signatures count {0}")]
    InvalidSignatureCount(usize),
    #[error("transaction input is not a deposit")]
    NotDeposit,
    #[error("unsupported deposit chain {}", hex::encode(.0))]
    UnsupportedChain(Hash),
    #[error("invalid deposit asset key {0}")]
    InvalidAssetKey(String),
    #[error("invalid deposit transaction hash {0}")]
    InvalidDepositTransaction(String),
    #[error("invalid asset {} {}", hex::encode(.declared), hex::encode(.deposit))]
    AssetMismatch { declared: Hash, deposit: Hash },
    #[error("invalid domain signature for deposit")]
    InvalidDomainSignature,
    #[error("invalid mint: {0}")]
    InvalidMint(&'static str),
    #[error("mint batch {batch} not after last batch {last}")]
    StaleMintBatch { batch: u64, last: u64 },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStore;

    fn asset() -> Hash {
        crate::hash_domain("meridian.test.asset", b"XIN")
    }

    /// Store a funding transaction with two outputs and return its hash.
    fn fund(store: &SledStore) -> Hash {
        let mut tx = Transaction::new(asset());
        tx.add_mint_input(MintData {
            group: crate::constants::MINT_GROUP_UNIVERSAL.into(),
            batch: 1,
            amount: 150,
        });
        tx.add_output(100, [1u8; 32]);
        tx.add_output(50, [2u8; 32]);
        let signed = SignedTransaction::new(tx);
        store.write_transaction(&signed).unwrap();
        signed.hash()
    }

    fn spend(source: Hash, amount: u64) -> SignedTransaction {
        let mut tx = Transaction::new(asset());
        tx.add_utxo_input(source, 0);
        tx.add_output(amount, [3u8; 32]);
        let mut signed = SignedTransaction::new(tx);
        signed.sign_input(&SigningKeypair::generate());
        signed
    }

    #[test]
    fn hash_ignores_signatures() {
        let mut tx = Transaction::new(asset());
        tx.add_utxo_input([9u8; 32], 0);
        tx.add_output(1, [3u8; 32]);
        let unsigned = SignedTransaction::new(tx);
        let mut signed = unsigned.clone();
        signed.sign_input(&SigningKeypair::generate());
        assert_eq!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn hash_changes_with_outputs() {
        let mut a = Transaction::new(asset());
        a.add_output(1, [3u8; 32]);
        let mut b = a.clone();
        b.outputs[0].amount = 2;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn check_mint_requires_single_mint_input() {
        let mut tx = Transaction::new(asset());
        tx.add_mint_input(MintData {
            group: crate::constants::MINT_GROUP_UNIVERSAL.into(),
            batch: 1,
            amount: 1,
        });
        assert!(SignedTransaction::new(tx.clone()).check_mint());
        tx.add_utxo_input([1u8; 32], 0);
        assert!(!SignedTransaction::new(tx).check_mint());
    }

    #[test]
    fn utxo_spend_validates() {
        let store = SledStore::open_temporary().unwrap();
        let source = fund(&store);
        assert!(spend(source, 100).validate(&store).is_ok());
    }

    #[test]
    fn utxo_spend_unbalanced_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let source = fund(&store);
        let result = spend(source, 99).validate(&store);
        assert!(matches!(
            result,
            Err(TxValidationError::Unbalanced {
                inputs: 100,
                outputs: 99
            })
        ));
    }

    #[test]
    fn utxo_missing_source_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let result = spend([7u8; 32], 100).validate(&store);
        assert!(matches!(result, Err(TxValidationError::MissingInput(_))));
    }

    #[test]
    fn unsigned_utxo_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let source = fund(&store);
        let mut tx = spend(source, 100);
        tx.signatures.clear();
        assert!(matches!(
            tx.validate(&store),
            Err(TxValidationError::InvalidSignatureCount(0))
        ));
    }

    #[test]
    fn duplicate_inputs_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let source = fund(&store);
        let mut tx = spend(source, 100);
        tx.transaction.add_utxo_input(source, 0);
        assert!(matches!(
            tx.validate(&store),
            Err(TxValidationError::DuplicateInput)
        ));
    }

    #[test]
    fn lock_inputs_conflict_detected() {
        let store = SledStore::open_temporary().unwrap();
        let source = fund(&store);
        let first = spend(source, 100);
        let mut second = spend(source, 100);
        second.transaction.extra = b"conflict".to_vec();

        first.lock_inputs(&store, false).unwrap();
        // Relocking by the same transaction is idempotent
        first.lock_inputs(&store, false).unwrap();
        assert!(matches!(
            second.lock_inputs(&store, false),
            Err(LockError::Conflict { .. })
        ));
        // Forced locking takes the input over
        second.lock_inputs(&store, true).unwrap();
    }
}
