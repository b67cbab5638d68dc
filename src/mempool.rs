//! Transaction mempool and the pending-block buffer.
//!
//! Received transactions sit in the mempool until a drain stamps them with a
//! timestamp and gas price and moves them into the pending buffer the miner
//! reads from. Both live in store tables, so entries survive restarts and
//! move atomically with the rest of a cycle.

use crate::blockchain::LedgerView;
use crate::error::{ChainError, Result};
use crate::store::StoreCoordinator;
use crate::transaction::{MempoolTransaction, PendingBlockTransaction};
use tracing::{debug, info, instrument};

#[derive(Clone)]
pub struct Mempool {
    coordinator: StoreCoordinator,
    chain_id: u64,
    gas_price: u64,
}

impl Mempool {
    pub fn new(coordinator: StoreCoordinator, chain_id: u64, gas_price: u64) -> Self {
        Self {
            coordinator,
            chain_id,
            gas_price,
        }
    }

    /// Admits a transaction. Receiving the same transaction again overwrites
    /// the existing entry; a different transaction reusing a queued nonce of
    /// the same sender is rejected.
    #[instrument(skip(self, tx), fields(tx = %tx.hash_str()))]
    pub async fn receive(&self, tx: MempoolTransaction) -> Result<()> {
        tx.validate_stateless(self.chain_id)?;
        tx.verify_signature()?;

        let mut txn = self.coordinator.open().await?;
        let sender = txn.account(&tx.tx.from)?;
        if tx.tx.nonce < sender.nonce {
            return Err(ChainError::Validation(format!(
                "Replayed nonce {} for {} (account is at {})",
                tx.tx.nonce,
                hex::encode(tx.tx.from),
                sender.nonce
            )));
        }

        let id = tx.hash();
        let queued = txn
            .mempool_entries()?
            .into_iter()
            .chain(txn.pending_entries()?.into_iter().map(|ptx| ptx.signed));
        for other in queued {
            if other.tx.from == tx.tx.from && other.tx.nonce == tx.tx.nonce && other.hash() != id {
                return Err(ChainError::Validation(format!(
                    "Nonce {} for {} is already taken by {}",
                    tx.tx.nonce,
                    hex::encode(tx.tx.from),
                    other.hash_str()
                )));
            }
        }

        txn.put_mempool(&tx)?;
        txn.commit()?;
        debug!("Transaction admitted to mempool");
        Ok(())
    }

    /// Moves every mempool entry into the pending buffer. Returns how many
    /// entries moved.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<usize> {
        let mut txn = self.coordinator.open().await?;
        let entries = txn.mempool_entries()?;
        if entries.is_empty() {
            txn.discard();
            return Ok(0);
        }

        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        for tx in &entries {
            txn.put_pending(&PendingBlockTransaction::stage(tx.clone(), timestamp, self.gas_price))?;
            txn.delete_mempool(&tx.hash())?;
        }
        txn.commit()?;

        info!(count = entries.len(), "Drained mempool into pending buffer");
        Ok(entries.len())
    }

    pub async fn len(&self) -> Result<usize> {
        let txn = self.coordinator.open().await?;
        let len = txn.mempool_entries()?.len();
        txn.discard();
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn pending_len(&self) -> Result<usize> {
        let txn = self.coordinator.open().await?;
        let len = txn.pending_entries()?.len();
        txn.discard();
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::genesis::GenesisBlockData;
    use crate::store::Stores;
    use crate::transaction::Transaction;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn mempool(gas_price: u64) -> Mempool {
        let genesis = GenesisBlockData::embedded().unwrap();
        let coordinator = StoreCoordinator::initialize(Stores::in_memory(), &genesis)
            .await
            .unwrap();
        Mempool::new(coordinator, genesis.chain_id, gas_price)
    }

    fn transfer(keypair: &KeyPair, nonce: u64) -> MempoolTransaction {
        Transaction::coin(1, nonce, keypair.address(), [7u8; 32], 5)
            .sign(keypair)
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_receive_is_idempotent() {
        timeout(Duration::from_secs(5), async {
            let pool = mempool(0).await;
            let alice = KeyPair::generate().unwrap();
            let tx = transfer(&alice, 0);

            pool.receive(tx.clone()).await.unwrap();
            pool.receive(tx).await.unwrap();
            assert_eq!(pool.len().await.unwrap(), 1);

            assert_eq!(pool.drain().await.unwrap(), 1);
            assert_eq!(pool.pending_len().await.unwrap(), 1);
            assert!(pool.is_empty().await.unwrap());
        })
        .await
        .expect("idempotent receive timed out");
    }

    #[tokio::test]
    async fn test_rejects_invalid_transactions() {
        timeout(Duration::from_secs(5), async {
            let pool = mempool(0).await;
            let alice = KeyPair::generate().unwrap();

            let wrong_chain = Transaction::coin(2, 0, alice.address(), [7u8; 32], 5)
                .sign(&alice)
                .unwrap();
            assert!(pool.receive(wrong_chain).await.is_err());

            let zero_value = Transaction::coin(1, 0, alice.address(), [7u8; 32], 0)
                .sign(&alice)
                .unwrap();
            assert!(pool.receive(zero_value).await.is_err());

            let mut unsigned = transfer(&alice, 0);
            unsigned.signature = Default::default();
            assert!(pool.receive(unsigned).await.is_err());

            let mallory = KeyPair::generate().unwrap();
            let forged = Transaction::coin(1, 0, alice.address(), [7u8; 32], 5)
                .sign(&mallory)
                .unwrap();
            assert!(pool.receive(forged).await.is_err());

            assert!(pool.is_empty().await.unwrap());
        })
        .await
        .expect("rejection test timed out");
    }

    #[tokio::test]
    async fn test_rejects_second_transaction_with_taken_nonce() {
        timeout(Duration::from_secs(5), async {
            let pool = mempool(0).await;
            let alice = KeyPair::generate().unwrap();
            let first = transfer(&alice, 0);
            let conflicting = Transaction::coin(1, 0, alice.address(), [8u8; 32], 9)
                .sign(&alice)
                .unwrap();

            pool.receive(first.clone()).await.unwrap();
            let err = pool.receive(conflicting.clone()).await.unwrap_err();
            assert!(matches!(err, ChainError::Validation(_)));

            // Still taken once the first one moved to the pending buffer.
            pool.drain().await.unwrap();
            assert!(pool.receive(conflicting).await.is_err());
            pool.receive(first).await.unwrap();
            pool.receive(transfer(&alice, 1)).await.unwrap();
            assert_eq!(pool.len().await.unwrap(), 2);
        })
        .await
        .expect("taken nonce test timed out");
    }

    #[tokio::test]
    async fn test_drain_stamps_gas_price() {
        timeout(Duration::from_secs(5), async {
            let pool = mempool(4).await;
            let alice = KeyPair::generate().unwrap();
            pool.receive(transfer(&alice, 0)).await.unwrap();
            pool.receive(transfer(&alice, 1)).await.unwrap();
            pool.drain().await.unwrap();

            let txn = pool.coordinator.open().await.unwrap();
            let pending = txn.pending_entries().unwrap();
            assert_eq!(pending.len(), 2);
            assert!(pending.iter().all(|p| p.gas_price == 4 && p.gas_units == 1 && p.timestamp > 0));
        })
        .await
        .expect("drain test timed out");
    }

    #[tokio::test]
    async fn test_empty_drain_is_noop() {
        timeout(Duration::from_secs(5), async {
            let pool = mempool(0).await;
            assert_eq!(pool.drain().await.unwrap(), 0);
            assert_eq!(pool.pending_len().await.unwrap(), 0);
        })
        .await
        .expect("empty drain timed out");
    }
}
