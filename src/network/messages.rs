//! Wire messages. Every payload is bincode.

use crate::blockchain::{BlockData, BlockHeader, Sha256Hash};
use crate::error::{ChainError, Result};
use crate::transaction::BlockTransaction;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A block as broadcast by its producer, before anyone has validated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedBlockData {
    pub hash: Sha256Hash,
    pub header: BlockHeader,
    #[serde(with = "serde_bytes")]
    pub header_signature: Vec<u8>,
    pub transactions: Vec<BlockTransaction>,
    #[serde(with = "serde_bytes")]
    pub validator: Vec<u8>,
}

impl From<BlockData> for ProposedBlockData {
    fn from(block: BlockData) -> Self {
        Self {
            hash: block.hash,
            header: block.header,
            header_signature: block.header_signature,
            transactions: block.transactions,
            validator: block.validator,
        }
    }
}

impl From<ProposedBlockData> for BlockData {
    fn from(proposed: ProposedBlockData) -> Self {
        Self {
            hash: proposed.hash,
            header: proposed.header,
            header_signature: proposed.header_signature,
            transactions: proposed.transactions,
            validator: proposed.validator,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest;

/// A peer's latest hash in hex; empty means "only genesis, ask elsewhere".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub latest_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub hash: Sha256Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub block: Option<BlockData>,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| ChainError::Serialization(format!("Malformed network message: {}", e)))
}
