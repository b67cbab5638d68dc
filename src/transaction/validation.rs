/// Validation logic for transactions separated from type definitions
use crate::crypto::{recover_address, ZERO_ADDRESS};
use crate::error::ChainError;
use crate::transaction::types::{SignedTransaction, TxType};

impl SignedTransaction {
    /// Checks that the signature recovers to `from`.
    pub fn verify_signature(&self) -> Result<(), ChainError> {
        if self.signature.is_absent() {
            return Err(ChainError::Validation("Transaction not signed".to_string()));
        }

        let signer = recover_address(&self.tx.signable_message(), &self.signature)
            .map_err(|e| ChainError::Validation(format!("Bad signature: {}", e)))?;
        if signer != self.tx.from {
            return Err(ChainError::Validation(format!(
                "Signature recovers to {} but transaction is from {}",
                hex::encode(signer),
                hex::encode(self.tx.from)
            )));
        }
        Ok(())
    }

    /// Stateless admission rules applied when a transaction enters the mempool.
    pub fn validate_stateless(&self, chain_id: u64) -> Result<(), ChainError> {
        let tx = &self.tx;

        if tx.chain_id != chain_id {
            return Err(ChainError::Validation(format!(
                "Wrong chain id {} (expected {})",
                tx.chain_id, chain_id
            )));
        }

        if tx.from == ZERO_ADDRESS {
            return Err(ChainError::Validation(
                "Sender address cannot be empty".to_string(),
            ));
        }

        match tx.tx_type {
            TxType::Coin => {
                if tx.to == ZERO_ADDRESS {
                    return Err(ChainError::Validation(
                        "Coin transfer needs a recipient".to_string(),
                    ));
                }
                if tx.value == 0 {
                    return Err(ChainError::Validation(
                        "Coin transfer value must be positive".to_string(),
                    ));
                }
            }
            TxType::Token => {
                if tx.value != 0 {
                    return Err(ChainError::Validation(
                        "Token transaction cannot carry coin value".to_string(),
                    ));
                }
                if tx.token_metadata_uri.trim().is_empty() {
                    return Err(ChainError::Validation(
                        "Token transaction needs a metadata URI".to_string(),
                    ));
                }
            }
        }

        if self.signature.is_absent() {
            return Err(ChainError::Validation("Transaction not signed".to_string()));
        }

        self.validate_size()
    }
}
