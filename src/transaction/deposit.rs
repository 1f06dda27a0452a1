//! Deposit inputs: value arriving from an external chain.
//!
//! A deposit is only admitted when its shape is exact (one deposit input, one
//! signature), its chain/asset key resolves to the transaction's asset, and a
//! configured domain key attests to it.

use serde::{Deserialize, Serialize};

use super::{Input, SignedTransaction, TxValidationError};
use crate::storage::RoundStore;
use crate::Hash;

/// An observed deposit on an external chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    /// External chain identifier.
    pub chain: Hash,
    /// Asset key on that chain (e.g. an ERC-20 contract address).
    pub asset_key: String,
    /// External transaction hash carrying the deposit.
    pub transaction_hash: String,
    /// Output index within the external transaction.
    pub output_index: u64,
    pub amount: u64,
}

impl DepositData {
    /// Asset identifier derived from the chain and asset key.
    pub fn asset_id(&self) -> Hash {
        let mut data = Vec::with_capacity(32 + self.asset_key.len());
        data.extend_from_slice(&self.chain);
        data.extend_from_slice(self.asset_key.as_bytes());
        crate::hash_domain("meridian.asset", &data)
    }

    /// Identity of the external output; a deposit may only be credited once.
    pub fn unique_key(&self) -> Hash {
        crate::hash_concat(&[
            b"deposit",
            &self.chain,
            self.transaction_hash.as_bytes(),
            &self.output_index.to_le_bytes(),
        ])
    }

    /// Chain-specific format checks on the asset key and external hash.
    pub fn validate_asset_input(&self) -> Result<(), TxValidationError> {
        if self.chain == crate::constants::ethereum_chain_id() {
            return self.validate_ethereum_asset_input();
        }
        Err(TxValidationError::UnsupportedChain(self.chain))
    }

    fn validate_ethereum_asset_input(&self) -> Result<(), TxValidationError> {
        if !is_lower_hex_prefixed(&self.asset_key, 20) {
            return Err(TxValidationError::InvalidAssetKey(self.asset_key.clone()));
        }
        if !is_lower_hex_prefixed(&self.transaction_hash, 32) {
            return Err(TxValidationError::InvalidDepositTransaction(
                self.transaction_hash.clone(),
            ));
        }
        if self.amount == 0 {
            return Err(TxValidationError::ZeroAmount);
        }
        Ok(())
    }
}

/// `0x` followed by exactly `len` bytes of lowercase hex.
fn is_lower_hex_prefixed(s: &str, len: usize) -> bool {
    let Some(body) = s.strip_prefix("0x") else {
        return false;
    };
    if body.len() != len * 2 || body.chars().any(|c| c.is_ascii_uppercase()) {
        return false;
    }
    hex::decode(body).is_ok()
}

impl SignedTransaction {
    fn verify_deposit_format(&self, deposit: &DepositData) -> Result<(), TxValidationError> {
        deposit.validate_asset_input()?;
        let deposit_asset = deposit.asset_id();
        if deposit_asset != self.transaction.asset {
            return Err(TxValidationError::AssetMismatch {
                declared: self.transaction.asset,
                deposit: deposit_asset,
            });
        }
        Ok(())
    }

    /// Gate a deposit transaction: exact shape, matching asset, and a
    /// signature over `msg` by at least one domain key.
    pub fn validate_deposit_input<S: RoundStore + ?Sized>(
        &self,
        store: &S,
        msg: &[u8],
    ) -> Result<(), TxValidationError> {
        if self.transaction.inputs.len() != 1 {
            return Err(TxValidationError::InvalidDepositInputCount(
                self.transaction.inputs.len(),
            ));
        }
        if self.signatures.len() != 1 || self.signatures[0].len() != 1 {
            return Err(TxValidationError::InvalidSignatureCount(self.signatures.len()));
        }
        let deposit = match &self.transaction.inputs[0] {
            Input::Deposit(d) => d,
            _ => return Err(TxValidationError::NotDeposit),
        };
        self.verify_deposit_format(deposit)?;

        let sig = &self.signatures[0][0];
        let domains = store.read_domains()?;
        let valid = domains
            .iter()
            .any(|d| d.public_spend_key.verify(msg, sig));
        if !valid {
            return Err(TxValidationError::InvalidDomainSignature);
        }
        Ok(())
    }
}
