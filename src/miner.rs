//! Block production
//!
//! A mining cycle runs in three steps so that no store transaction is open
//! while the proof is being sealed:
//!
//! 1. assemble: dry-run the pending buffer against the ledger, build the
//!    header, discard. Entries the ledger rejects are evicted rather than
//!    left to fail every later cycle;
//! 2. seal: the consensus strategy signs or searches for a nonce on a
//!    blocking thread, aborting on shutdown or when another block lands;
//! 3. commit: re-open, confirm the tip has not moved, apply through the
//!    validator path and commit.
//!
//! The sealed block is then broadcast. A failed broadcast is logged only.

use crate::blockchain::{
    apply_transaction, ledger_roots, BlockData, BlockHeader, ChainTip, LedgerView,
};
use crate::context::ChainContext;
use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::keyed_mutex::MINING_LOCK;
use crate::network::{encode, ProposedBlockData, BLOCKS_TOPIC};
use crate::shutdown::CancelSignal;
use crate::transaction::{BlockTransaction, PendingBlockTransaction};
use crate::validator::apply_block;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, instrument, warn};

pub struct Miner {
    ctx: ChainContext,
    beneficiary: Address,
    cancel: CancelSignal,
}

/// A header ready for sealing plus what it was built from.
struct Candidate {
    tip: ChainTip,
    header: BlockHeader,
    transactions: Vec<BlockTransaction>,
}

impl Miner {
    pub fn new(ctx: ChainContext, beneficiary: Address, cancel: CancelSignal) -> Self {
        Self {
            ctx,
            beneficiary,
            cancel,
        }
    }

    /// Runs one mining cycle. Returns `None` when the pending buffer is
    /// empty.
    #[instrument(skip(self), fields(strategy = self.ctx.strategy.name()))]
    pub async fn mine_once(&self) -> Result<Option<BlockData>> {
        let _role = self.ctx.locks.acquire(MINING_LOCK).await;

        let Some(candidate) = self.assemble().await? else {
            return Ok(None);
        };
        let block = self.seal(candidate.header, candidate.transactions, candidate.tip).await?;
        self.commit(&block, candidate.tip).await?;
        info!(
            hash = %block.hash_hex(),
            number = block.number(),
            txs = block.transactions.len(),
            "Mined block"
        );

        self.broadcast(&block).await;
        Ok(Some(block))
    }

    async fn assemble(&self) -> Result<Option<Candidate>> {
        let mut txn = self.ctx.coordinator.open().await?;
        let mut pending = txn.pending_entries()?;
        if pending.is_empty() {
            txn.discard();
            return Ok(None);
        }
        sort_pending(&mut pending);

        let tip = txn.tip()?;
        let (state_root, tokens_root) = ledger_roots(&txn)?;

        // Rejected entries leave the ledger untouched, so the rest still
        // apply in order.
        let mut included = Vec::with_capacity(pending.len());
        let mut rejected = Vec::new();
        for ptx in pending {
            let applied = ptx
                .signed
                .verify_signature()
                .and_then(|_| apply_transaction(&mut txn, &ptx, &self.beneficiary));
            match applied {
                Ok(()) => included.push(ptx),
                Err(e) if e.is_rejection() => {
                    warn!(tx = %ptx.signed.hash_str(), error = %e, "Dropping pending transaction");
                    rejected.push(ptx);
                }
                Err(e) => return Err(e),
            }
        }
        let latest_token_id = txn.latest_token_id()?;
        txn.discard();

        if !rejected.is_empty() {
            self.evict(&rejected).await?;
        }
        if included.is_empty() {
            debug!(dropped = rejected.len(), "No applicable pending transactions");
            return Ok(None);
        }

        let transactions: Vec<BlockTransaction> =
            included.into_iter().map(BlockTransaction::from).collect();
        let mut header = BlockHeader {
            number: tip.number + 1,
            prev_block_hash: tip.hash,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            beneficiary: self.beneficiary,
            difficulty: 0,
            mining_reward: self.ctx.rules.mining_reward,
            state_root,
            trans_root: BlockData::calculate_merkle_root(&transactions),
            tokens_root,
            nonce: 0,
            latest_token_id,
        };
        self.ctx.strategy.build_candidate(&mut header);
        debug!(number = header.number, txs = transactions.len(), "Assembled candidate");

        Ok(Some(Candidate {
            tip,
            header,
            transactions,
        }))
    }

    /// Removes transactions that can never apply from the pending buffer
    /// and the mempool.
    async fn evict(&self, rejected: &[PendingBlockTransaction]) -> Result<()> {
        let mut txn = self.ctx.coordinator.open().await?;
        for ptx in rejected {
            txn.delete_pending(&ptx.id())?;
            txn.delete_mempool(&ptx.signed.hash())?;
        }
        txn.commit()?;
        info!(count = rejected.len(), "Evicted invalid pending transactions");
        Ok(())
    }

    async fn seal(
        &self,
        header: BlockHeader,
        transactions: Vec<BlockTransaction>,
        tip: ChainTip,
    ) -> Result<BlockData> {
        let strategy = self.ctx.strategy.clone();
        let cancel = self.cancel.clone();
        let tips = self.ctx.coordinator.subscribe_tip();

        let seal = tokio::task::spawn_blocking(move || {
            let should_abort = || cancel.is_cancelled() || *tips.borrow() != tip.hash;
            strategy.finalize_proof(header, &should_abort)
        })
        .await
        .map_err(|e| {
            if e.is_cancelled() {
                ChainError::Cancelled
            } else {
                ChainError::InvalidProof(format!("sealing task failed: {}", e))
            }
        })??;

        Ok(BlockData {
            hash: seal.hash,
            header: seal.header,
            header_signature: seal.header_signature,
            transactions,
            validator: seal.validator,
        })
    }

    async fn commit(&self, block: &BlockData, tip: ChainTip) -> Result<()> {
        let mut txn = self.ctx.coordinator.open().await?;
        let current = txn.tip()?;
        if current.hash != tip.hash {
            return Err(ChainError::StaleTip {
                expected: tip.hash_hex(),
                actual: current.hash_hex(),
            });
        }

        apply_block(&mut txn, block, self.ctx.strategy.as_ref(), &self.ctx.rules)?;
        txn.commit()?;
        self.ctx.cache.insert_block(block).await;
        Ok(())
    }

    async fn broadcast(&self, block: &BlockData) {
        let published = match encode(&ProposedBlockData::from(block.clone())) {
            Ok(bytes) => self.ctx.transport.publish(BLOCKS_TOPIC, bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(hash = %block.hash_hex(), error = %e, "Failed to broadcast mined block");
        }
    }
}

/// Deterministic block order: staging time, then identity. Each sender keeps
/// the slots it got but fills them in nonce order, so a later nonce never
/// lands ahead of an earlier one.
pub fn sort_pending(pending: &mut Vec<PendingBlockTransaction>) {
    pending.sort_by_cached_key(|ptx| (ptx.timestamp, ptx.id()));

    let slots: Vec<Address> = pending.iter().map(|ptx| ptx.signed.tx.from).collect();
    let mut by_sender: HashMap<Address, VecDeque<PendingBlockTransaction>> = HashMap::new();
    for ptx in pending.drain(..) {
        by_sender.entry(ptx.signed.tx.from).or_default().push_back(ptx);
    }
    for queue in by_sender.values_mut() {
        queue
            .make_contiguous()
            .sort_by_cached_key(|ptx| (ptx.signed.tx.nonce, ptx.id()));
    }
    for sender in slots {
        if let Some(ptx) = by_sender.get_mut(&sender).and_then(VecDeque::pop_front) {
            pending.push(ptx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transaction::Transaction;

    #[test]
    fn test_pending_order_is_by_time_then_id() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let stage = |key: &KeyPair, nonce: u64, ts: u64| {
            PendingBlockTransaction::stage(
                Transaction::coin(1, nonce, key.address(), [1u8; 32], 1).sign(key).unwrap(),
                ts,
                0,
            )
        };
        let mut pending = vec![stage(&bob, 0, 30), stage(&alice, 0, 10), stage(&bob, 1, 20)];
        sort_pending(&mut pending);

        let times: Vec<u64> = pending.iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(pending[0].signed.tx.from, alice.address());
    }

    #[test]
    fn test_sender_nonces_stay_ascending() {
        let alice = KeyPair::generate().unwrap();
        let stage = |nonce: u64, ts: u64| {
            PendingBlockTransaction::stage(
                Transaction::coin(1, nonce, alice.address(), [1u8; 32], 1).sign(&alice).unwrap(),
                ts,
                0,
            )
        };
        // Nonce 1 was staged before nonce 0, and four share one drain.
        let mut pending = vec![stage(0, 20), stage(1, 10), stage(2, 20), stage(3, 20), stage(4, 20)];
        sort_pending(&mut pending);

        let nonces: Vec<u64> = pending.iter().map(|p| p.signed.tx.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
    }
}
