/// Transaction types for AuthorityChain
use crate::blockchain::Sha256Hash;
use crate::crypto::{Address, KeyPair, RecoverableSig};
use crate::error::ChainError;
use sha2::{Digest, Sha256};
use std::ops::Deref;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Every transaction costs the same flat number of gas units.
pub const TX_GAS_UNITS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxType {
    /// Moves `value` from `from` to `to`.
    Coin,
    /// Mints or transfers token `token_id` to `to`.
    Token,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub from: Address,
    pub to: Address,
    pub value: u64,
    pub tip: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub tx_type: TxType,
    pub token_id: u64,
    pub token_metadata_uri: String,
    pub token_nonce: u64,
}

impl Transaction {
    pub fn coin(chain_id: u64, nonce: u64, from: Address, to: Address, value: u64) -> Self {
        Transaction {
            chain_id,
            nonce,
            from,
            to,
            value,
            tip: 0,
            data: Vec::new(),
            tx_type: TxType::Coin,
            token_id: 0,
            token_metadata_uri: String::new(),
            token_nonce: 0,
        }
    }

    pub fn token(
        chain_id: u64,
        nonce: u64,
        from: Address,
        to: Address,
        token_id: u64,
        metadata_uri: impl Into<String>,
        token_nonce: u64,
    ) -> Self {
        Transaction {
            chain_id,
            nonce,
            from,
            to,
            value: 0,
            tip: 0,
            data: Vec::new(),
            tx_type: TxType::Token,
            token_id,
            token_metadata_uri: metadata_uri.into(),
            token_nonce,
        }
    }

    pub fn with_tip(mut self, tip: u64) -> Self {
        self.tip = tip;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn is_token(&self) -> bool {
        self.tx_type == TxType::Token
    }

    /// Canonical bytes covered by the sender's signature.
    pub fn signable_message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(match self.tx_type {
            TxType::Coin => b"COIN:".as_slice(),
            TxType::Token => b"TOKEN:".as_slice(),
        });
        message.extend_from_slice(&self.chain_id.to_le_bytes());
        message.extend_from_slice(&self.nonce.to_le_bytes());
        message.extend_from_slice(&self.from);
        message.extend_from_slice(&self.to);
        message.extend_from_slice(&self.value.to_le_bytes());
        message.extend_from_slice(&self.tip.to_le_bytes());
        message.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        message.extend_from_slice(&self.data);
        message.extend_from_slice(&self.token_id.to_le_bytes());
        message.extend_from_slice(&(self.token_metadata_uri.len() as u64).to_le_bytes());
        message.extend_from_slice(self.token_metadata_uri.as_bytes());
        message.extend_from_slice(&self.token_nonce.to_le_bytes());
        message
    }

    pub fn sign(self, keypair: &KeyPair) -> Result<SignedTransaction, ChainError> {
        let signature = keypair.sign_recoverable(&self.signable_message())?;
        Ok(SignedTransaction {
            tx: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub signature: RecoverableSig,
}

impl SignedTransaction {
    /// Identity of the transaction: content plus signature.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.tx.signable_message());
        hasher.update(self.signature.to_bytes());
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::Validation(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::Validation(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }
}

/// A signed transaction as held by the mempool.
pub type MempoolTransaction = SignedTransaction;

/// A mempool transaction staged for the next mining cycle.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingBlockTransaction {
    pub signed: SignedTransaction,
    pub timestamp: u64,
    pub gas_price: u64,
    pub gas_units: u64,
}

impl PendingBlockTransaction {
    pub fn stage(signed: SignedTransaction, timestamp: u64, gas_price: u64) -> Self {
        Self {
            signed,
            timestamp,
            gas_price,
            gas_units: TX_GAS_UNITS,
        }
    }

    /// Identity shared with the originating mempool entry.
    pub fn id(&self) -> Sha256Hash {
        self.signed.hash()
    }

    /// Hash used as a merkle leaf; covers the staging data as well.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.signed.hash());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.gas_price.to_le_bytes());
        hasher.update(self.gas_units.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn gas_cost(&self) -> Result<u64, ChainError> {
        self.gas_price
            .checked_mul(self.gas_units)
            .ok_or_else(|| ChainError::Validation("Gas cost overflows".to_string()))
    }

    /// Everything the sender pays: value, tip and gas.
    pub fn total_cost(&self) -> Result<u64, ChainError> {
        let tx = &self.signed.tx;
        tx.value
            .checked_add(tx.tip)
            .and_then(|v| v.checked_add(self.gas_price.checked_mul(self.gas_units)?))
            .ok_or_else(|| ChainError::Validation("Transaction cost overflows".to_string()))
    }
}

/// A pending transaction frozen into a block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BlockTransaction(PendingBlockTransaction);

impl BlockTransaction {
    pub fn into_pending(self) -> PendingBlockTransaction {
        self.0
    }
}

impl From<PendingBlockTransaction> for BlockTransaction {
    fn from(pending: PendingBlockTransaction) -> Self {
        BlockTransaction(pending)
    }
}

impl Deref for BlockTransaction {
    type Target = PendingBlockTransaction;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
