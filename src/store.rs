//! Storage transaction coordinator
//!
//! Ledger, chain, mempool and pending-buffer tables are opened, committed and
//! discarded together. Opening also takes the single ledger-write lock, so
//! mining, validation and backfill never hold overlapping transactions.

use crate::blockchain::{Account, BlockData, ChainTip, LedgerView, Sha256Hash, Token, GENESIS_MARKER};
use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::genesis::GenesisBlockData;
use crate::persistence::{KvTable, MemoryTable, Repository, SqliteTable};
use crate::transaction::{MempoolTransaction, PendingBlockTransaction};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

const POINTER_KEY: &[u8] = b"latest";

/// The repositories one cycle moves together.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn KvTable>,
    pub tokens: Arc<dyn KvTable>,
    pub latest_hash: Arc<dyn KvTable>,
    pub latest_token_id: Arc<dyn KvTable>,
    pub blocks: Arc<dyn KvTable>,
    pub mempool: Arc<dyn KvTable>,
    pub pending: Arc<dyn KvTable>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            accounts: Arc::new(MemoryTable::new("accounts")),
            tokens: Arc::new(MemoryTable::new("tokens")),
            latest_hash: Arc::new(MemoryTable::new("latest_hash")),
            latest_token_id: Arc::new(MemoryTable::new("latest_token_id")),
            blocks: Arc::new(MemoryTable::new("blocks")),
            mempool: Arc::new(MemoryTable::new("mempool")),
            pending: Arc::new(MemoryTable::new("pending")),
        }
    }

    /// One SQLite database per table under `dir`.
    pub fn sqlite(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &'static str| -> Result<Arc<dyn KvTable>> {
            let table = SqliteTable::open_path(name, &dir.join(format!("{}.db", name)))?;
            Ok(Arc::new(table))
        };
        Ok(Self {
            accounts: open("accounts")?,
            tokens: open("tokens")?,
            latest_hash: open("latest_hash")?,
            latest_token_id: open("latest_token_id")?,
            blocks: open("blocks")?,
            mempool: open("mempool")?,
            pending: open("pending")?,
        })
    }

    /// Commit order. Data tables go first and the pointers last, so a
    /// pointer never becomes durable ahead of the records it names.
    fn all(&self) -> [&Arc<dyn KvTable>; 7] {
        [
            &self.accounts,
            &self.tokens,
            &self.blocks,
            &self.mempool,
            &self.pending,
            &self.latest_token_id,
            &self.latest_hash,
        ]
    }
}

/// Single-row value with a version bumped on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pointer<T> {
    version: u64,
    value: T,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(table: &'static str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ChainError::Corruption {
        table,
        reason: e.to_string(),
    })
}

/// Opens coordinated transactions over a [`Stores`] set.
#[derive(Clone)]
pub struct StoreCoordinator {
    stores: Stores,
    write_lock: Arc<Mutex<()>>,
    tip: Arc<watch::Sender<Sha256Hash>>,
}

impl StoreCoordinator {
    /// Wraps `stores`, writing the genesis ledger first if the chain is empty.
    pub async fn initialize(stores: Stores, genesis: &GenesisBlockData) -> Result<Self> {
        let (tip, _) = watch::channel(GENESIS_MARKER);
        let coordinator = Self {
            stores,
            write_lock: Arc::new(Mutex::new(())),
            tip: Arc::new(tip),
        };

        let mut txn = coordinator.open().await?;
        let latest = match txn.read_pointer::<Sha256Hash>(&txn.stores.latest_hash, "latest_hash")? {
            Some(pointer) => {
                txn.discard();
                pointer.value
            }
            None => {
                for (address, balance) in genesis.opening_balances()? {
                    txn.put_account(&Account {
                        address,
                        balance,
                        nonce: 0,
                    })?;
                }
                txn.set_latest_hash(GENESIS_MARKER)?;
                txn.set_latest_token_id(0)?;
                txn.commit()?;
                info!(chain_id = genesis.chain_id, "Initialized ledger from genesis");
                GENESIS_MARKER
            }
        };

        coordinator.tip.send_replace(latest);
        Ok(coordinator)
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Opens every repository. Waits for the ledger-write lock first.
    pub async fn open(&self) -> Result<StoreTransaction> {
        let guard = self.write_lock.clone().lock_owned().await;
        self.open_with(guard)
    }

    /// Like [`open`](Self::open) but gives up if another cycle holds the lock.
    pub fn try_open(&self) -> Option<Result<StoreTransaction>> {
        let guard = self.write_lock.clone().try_lock_owned().ok()?;
        Some(self.open_with(guard))
    }

    fn open_with(&self, guard: OwnedMutexGuard<()>) -> Result<StoreTransaction> {
        let mut opened: Vec<&Arc<dyn KvTable>> = Vec::new();
        for repo in self.stores.all() {
            if let Err(e) = repo.open() {
                warn!(table = repo.name(), error = %e, "Failed to open repository, discarding the rest");
                for repo in opened {
                    if let Err(e) = repo.discard() {
                        warn!(table = repo.name(), error = %e, "Discard after failed open also failed");
                    }
                }
                return Err(e);
            }
            opened.push(repo);
        }

        Ok(StoreTransaction {
            stores: self.stores.clone(),
            tip: self.tip.clone(),
            _write_guard: guard,
            finished: false,
            advanced_tip: None,
        })
    }

    /// Hash of the last committed block, without opening a transaction.
    pub fn latest_hash(&self) -> Sha256Hash {
        *self.tip.borrow()
    }

    /// Notified with the new latest hash after every commit that moved it.
    pub fn subscribe_tip(&self) -> watch::Receiver<Sha256Hash> {
        self.tip.subscribe()
    }
}

/// An open bracket over every repository. Dropping it discards.
pub struct StoreTransaction {
    stores: Stores,
    tip: Arc<watch::Sender<Sha256Hash>>,
    _write_guard: OwnedMutexGuard<()>,
    finished: bool,
    advanced_tip: Option<Sha256Hash>,
}

impl StoreTransaction {
    /// Flushes every repository in [`Stores::all`] order. A failure part way
    /// is logged and the repositories not yet committed are discarded; the
    /// ones already committed stay committed. The latest-hash pointer is
    /// flushed last, so the tip always names a stored block.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let repos = self.stores.all();
        for (idx, repo) in repos.iter().enumerate() {
            if let Err(e) = repo.commit() {
                error!(
                    table = repo.name(),
                    committed = idx,
                    error = %e,
                    "Commit failed part way; earlier repositories stay committed"
                );
                for rest in &repos[idx + 1..] {
                    if let Err(e) = rest.discard() {
                        warn!(table = rest.name(), error = %e, "Discard after failed commit failed");
                    }
                }
                return Err(e);
            }
        }

        if let Some(hash) = self.advanced_tip {
            self.tip.send_replace(hash);
        }
        Ok(())
    }

    pub fn discard(mut self) {
        self.discard_all();
    }

    fn discard_all(&mut self) {
        self.finished = true;
        for repo in self.stores.all() {
            if let Err(e) = repo.discard() {
                warn!(table = repo.name(), error = %e, "Failed to discard repository");
            }
        }
    }

    fn read_pointer<T: DeserializeOwned>(
        &self,
        table: &Arc<dyn KvTable>,
        name: &'static str,
    ) -> Result<Option<Pointer<T>>> {
        table
            .get(POINTER_KEY)?
            .map(|bytes| decode::<Pointer<T>>(name, &bytes))
            .transpose()
    }

    fn write_pointer<T: Serialize + DeserializeOwned>(
        &self,
        table: &Arc<dyn KvTable>,
        name: &'static str,
        value: T,
    ) -> Result<()> {
        let version = self
            .read_pointer::<T>(table, name)?
            .map_or(0, |p| p.version + 1);
        table.put(POINTER_KEY, &encode(&Pointer { version, value })?)
    }

    pub fn latest_hash(&self) -> Result<Sha256Hash> {
        self.read_pointer::<Sha256Hash>(&self.stores.latest_hash, "latest_hash")?
            .map(|p| p.value)
            .ok_or(ChainError::Corruption {
                table: "latest_hash",
                reason: "pointer missing; ledger was never initialized".to_string(),
            })
    }

    pub fn set_latest_hash(&mut self, hash: Sha256Hash) -> Result<()> {
        self.write_pointer(&self.stores.latest_hash, "latest_hash", hash)?;
        self.advanced_tip = Some(hash);
        Ok(())
    }

    /// The block the next block must extend.
    pub fn tip(&self) -> Result<ChainTip> {
        let hash = self.latest_hash()?;
        if hash == GENESIS_MARKER {
            return Ok(ChainTip::genesis());
        }
        let block = self.block(&hash)?.ok_or_else(|| ChainError::Corruption {
            table: "blocks",
            reason: format!("latest hash {} has no block", hex::encode(hash)),
        })?;
        Ok(ChainTip {
            hash,
            number: block.header.number,
        })
    }

    pub fn block(&self, hash: &Sha256Hash) -> Result<Option<BlockData>> {
        self.stores
            .blocks
            .get(hash)?
            .map(|bytes| decode::<BlockData>("blocks", &bytes))
            .transpose()
    }

    pub fn has_block(&self, hash: &Sha256Hash) -> Result<bool> {
        Ok(self.stores.blocks.get(hash)?.is_some())
    }

    pub fn put_block(&mut self, block: &BlockData) -> Result<()> {
        debug!(hash = %block.hash_hex(), number = block.number(), "Persisting block");
        self.stores.blocks.put(&block.hash, &encode(block)?)
    }

    pub fn put_mempool(&mut self, tx: &MempoolTransaction) -> Result<()> {
        self.stores.mempool.put(&tx.hash(), &encode(tx)?)
    }

    pub fn mempool_entries(&self) -> Result<Vec<MempoolTransaction>> {
        self.stores
            .mempool
            .scan()?
            .iter()
            .map(|(_, bytes)| decode("mempool", bytes))
            .collect()
    }

    pub fn delete_mempool(&mut self, id: &Sha256Hash) -> Result<()> {
        self.stores.mempool.delete(id)
    }

    pub fn put_pending(&mut self, ptx: &PendingBlockTransaction) -> Result<()> {
        self.stores.pending.put(&ptx.id(), &encode(ptx)?)
    }

    pub fn pending_entries(&self) -> Result<Vec<PendingBlockTransaction>> {
        self.stores
            .pending
            .scan()?
            .iter()
            .map(|(_, bytes)| decode("pending", bytes))
            .collect()
    }

    pub fn delete_pending(&mut self, id: &Sha256Hash) -> Result<()> {
        self.stores.pending.delete(id)
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Store transaction dropped without commit, discarding");
            self.discard_all();
        }
    }
}

impl LedgerView for StoreTransaction {
    fn account(&self, address: &Address) -> Result<Account> {
        Ok(match self.stores.accounts.get(address)? {
            Some(bytes) => decode("accounts", &bytes)?,
            None => Account::empty(*address),
        })
    }

    fn put_account(&mut self, account: &Account) -> Result<()> {
        self.stores.accounts.put(&account.address, &encode(account)?)
    }

    fn accounts(&self) -> Result<Vec<Account>> {
        self.stores
            .accounts
            .scan()?
            .iter()
            .map(|(_, bytes)| decode("accounts", bytes))
            .collect()
    }

    fn token(&self, id: u64) -> Result<Option<Token>> {
        self.stores
            .tokens
            .get(&id.to_be_bytes())?
            .map(|bytes| decode("tokens", &bytes))
            .transpose()
    }

    fn put_token(&mut self, token: &Token) -> Result<()> {
        self.stores.tokens.put(&token.id.to_be_bytes(), &encode(token)?)
    }

    fn tokens(&self) -> Result<Vec<Token>> {
        self.stores
            .tokens
            .scan()?
            .iter()
            .map(|(_, bytes)| decode("tokens", bytes))
            .collect()
    }

    fn latest_token_id(&self) -> Result<u64> {
        Ok(self
            .read_pointer::<u64>(&self.stores.latest_token_id, "latest_token_id")?
            .map_or(0, |p| p.value))
    }

    fn set_latest_token_id(&mut self, id: u64) -> Result<()> {
        self.write_pointer(&self.stores.latest_token_id, "latest_token_id", id)
    }
}
