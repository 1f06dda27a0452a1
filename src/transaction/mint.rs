//! Structural gate for mint transactions.
//!
//! Issuance amounts and schedules are decided elsewhere; the kernel only
//! checks that a mint is well formed and that batches strictly advance.

use serde::{Deserialize, Serialize};

use super::{Input, SignedTransaction, TxValidationError};
use crate::storage::RoundStore;

/// A protocol issuance input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintData {
    pub group: String,
    pub batch: u64,
    pub amount: u64,
}

impl SignedTransaction {
    pub fn validate_mint<S: RoundStore + ?Sized>(&self, store: &S) -> Result<(), TxValidationError> {
        let mint = match self.transaction.inputs.as_slice() {
            [Input::Mint(m)] => m,
            _ => return Err(TxValidationError::InvalidMint("exactly one mint input")),
        };
        if !self.signatures.is_empty() {
            return Err(TxValidationError::InvalidMint("mint carries no signatures"));
        }
        if mint.group != crate::constants::MINT_GROUP_UNIVERSAL {
            return Err(TxValidationError::InvalidMint("unknown mint group"));
        }
        if mint.amount == 0 {
            return Err(TxValidationError::InvalidMint("zero amount"));
        }
        let total = self
            .transaction
            .output_total()
            .ok_or(TxValidationError::AmountOverflow)?;
        if total != mint.amount {
            return Err(TxValidationError::Unbalanced {
                inputs: mint.amount,
                outputs: total,
            });
        }
        if let Some(last) = store.read_last_mint_batch()? {
            if mint.batch <= last {
                return Err(TxValidationError::StaleMintBatch {
                    batch: mint.batch,
                    last,
                });
            }
        }
        Ok(())
    }
}
