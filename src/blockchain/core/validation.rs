use crate::error::ChainError;
use std::collections::HashSet;

use super::chain::{BlockData, ChainTip};

/// Structural checks that need nothing but the block and the local tip:
/// the declared hash, continuity with the tip, the transaction root and
/// duplicate transactions inside the block.
pub fn validate_block_structure(block: &BlockData, tip: &ChainTip) -> Result<(), ChainError> {
    let computed = block.header.hash();
    if computed != block.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Declared hash {} does not match header hash {}",
            block.hash_hex(),
            hex::encode(computed)
        )));
    }

    if block.header.number != tip.number + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block number. Expected {}, but got {}.",
            tip.number + 1,
            block.header.number
        )));
    }

    if block.header.prev_block_hash != tip.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid previous block hash. Expected {}, but got {}.",
            tip.hash_hex(),
            hex::encode(block.header.prev_block_hash)
        )));
    }

    let expected_root = BlockData::calculate_merkle_root(&block.transactions);
    if expected_root != block.header.trans_root {
        return Err(ChainError::InvalidBlock(format!(
            "Merkle root mismatch. Expected {}, but got {}.",
            hex::encode(expected_root),
            hex::encode(block.header.trans_root)
        )));
    }

    validate_no_duplicate_transactions(block)
}

pub fn validate_no_duplicate_transactions(block: &BlockData) -> Result<(), ChainError> {
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        if !seen.insert(tx.id()) {
            return Err(ChainError::InvalidBlock(format!(
                "Transaction {} appears twice in block {}",
                hex::encode(tx.id()),
                block.hash_hex()
            )));
        }
    }
    Ok(())
}
