//! Block validator
//!
//! Receives proposed blocks, checks them against the local tip and the
//! configured proof, and applies them. [`apply_block`] is the single place a
//! block reaches the ledger; the miner's commit step and sync backfill use it
//! too.

use crate::blockchain::{
    execute_block, ledger_roots, validate_block_structure, BlockData, LedgerView,
};
use crate::consensus::ConsensusStrategy;
use crate::context::{ChainContext, ChainRules};
use crate::error::{ChainError, Result};
use crate::keyed_mutex::VALIDATING_LOCK;
use crate::network::{decode, ProposedBlockData, BLOCKS_TOPIC};
use crate::store::StoreTransaction;
use std::time::Duration;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Committed,
    /// Already stored; nothing was done.
    Duplicate,
}

/// Verifies `block` against the open transaction's tip and applies it:
/// proof, continuity, parent roots, every transaction, then the block record
/// and the latest-hash pointer. On error the caller discards.
pub fn apply_block(
    txn: &mut StoreTransaction,
    block: &BlockData,
    strategy: &dyn ConsensusStrategy,
    rules: &ChainRules,
) -> Result<()> {
    strategy.verify_proof(block)?;

    let tip = txn.tip()?;
    validate_block_structure(block, &tip)?;

    if block.header.mining_reward != rules.mining_reward {
        return Err(ChainError::InvalidBlock(format!(
            "mining reward {} differs from the chain's {}",
            block.header.mining_reward, rules.mining_reward
        )));
    }
    if let Some(tx) = block
        .transactions
        .iter()
        .find(|tx| tx.signed.tx.chain_id != rules.chain_id)
    {
        return Err(ChainError::InvalidBlock(format!(
            "transaction {} is for chain {}",
            hex::encode(tx.id()),
            tx.signed.tx.chain_id
        )));
    }

    let (state_root, tokens_root) = ledger_roots(&*txn)?;
    if state_root != block.header.state_root {
        return Err(ChainError::InvalidBlock(format!(
            "state root mismatch: local {}, block {}",
            hex::encode(state_root),
            hex::encode(block.header.state_root)
        )));
    }
    if tokens_root != block.header.tokens_root {
        return Err(ChainError::InvalidBlock(format!(
            "tokens root mismatch: local {}, block {}",
            hex::encode(tokens_root),
            hex::encode(block.header.tokens_root)
        )));
    }

    execute_block(
        &mut *txn,
        block.transactions.iter().map(|tx| &**tx),
        &block.header.beneficiary,
        block.header.mining_reward,
    )?;

    let latest_token_id = txn.latest_token_id()?;
    if latest_token_id != block.header.latest_token_id {
        return Err(ChainError::InvalidBlock(format!(
            "latest token id {} after applying, header says {}",
            latest_token_id, block.header.latest_token_id
        )));
    }

    txn.put_block(block)?;
    txn.set_latest_hash(block.hash)?;
    for tx in &block.transactions {
        txn.delete_mempool(&tx.id())?;
        txn.delete_pending(&tx.id())?;
    }
    Ok(())
}

pub struct Validator {
    ctx: ChainContext,
    receive_timeout: Duration,
}

impl Validator {
    pub fn new(ctx: ChainContext, receive_timeout: Duration) -> Self {
        Self {
            ctx,
            receive_timeout,
        }
    }

    /// Waits for the next proposal and processes it. A quiet network is
    /// reported as [`ChainError::NetworkSilence`].
    pub async fn receive_once(&self) -> Result<ValidationOutcome> {
        let (from, bytes) = self
            .ctx
            .transport
            .next_message(BLOCKS_TOPIC, self.receive_timeout)
            .await?
            .ok_or(ChainError::NetworkSilence)?;
        let proposed: ProposedBlockData = decode(&bytes)?;
        debug!(peer = %from, hash = %hex::encode(proposed.hash), "Received proposed block");
        self.process(proposed.into()).await
    }

    #[instrument(skip(self, block), fields(hash = %block.hash_hex(), number = block.number()))]
    pub async fn process(&self, block: BlockData) -> Result<ValidationOutcome> {
        if self.ctx.cache.contains(&block.hash).await {
            return Ok(ValidationOutcome::Duplicate);
        }

        let _dedup = self
            .ctx
            .locks
            .acquire(&format!("block:{}", block.hash_hex()))
            .await;
        let _role = self.ctx.locks.acquire(VALIDATING_LOCK).await;

        let mut txn = self.ctx.coordinator.open().await?;
        if txn.has_block(&block.hash)? {
            txn.discard();
            debug!("Block already stored");
            return Ok(ValidationOutcome::Duplicate);
        }

        apply_block(&mut txn, &block, self.ctx.strategy.as_ref(), &self.ctx.rules)?;
        txn.commit()?;
        self.ctx.cache.insert_block(&block).await;

        info!(txs = block.transactions.len(), "Validated and committed block");
        Ok(ValidationOutcome::Committed)
    }
}
