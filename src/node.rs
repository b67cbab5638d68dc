//! Node assembly and worker supervision
//!
//! A [`Node`] wires the stores, consensus strategy, transport and caches
//! together and runs one supervised task per role: transaction intake,
//! mempool drain, mining, block validation, the sync client and the two
//! sync servers. Each task repeats a single step; the supervisor decides how
//! long to wait after it based on the outcome.

use crate::blockchain::{Account, BlockData, ChainTip, LedgerView};
use crate::cache::BlockCache;
use crate::config::Config;
use crate::consensus::strategy_from_config;
use crate::context::{ChainContext, ChainRules};
use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::genesis::GenesisBlockData;
use crate::keyed_mutex::KeyedMutex;
use crate::mempool::Mempool;
use crate::miner::Miner;
use crate::network::{decode, encode, PeerId, Transport, TRANSACTIONS_TOPIC};
use crate::shutdown::{CancelSignal, ShutdownController};
use crate::store::{StoreCoordinator, Stores};
use crate::sync::{SyncClient, SyncServer};
use crate::transaction::SignedTransaction;
use crate::validator::Validator;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backoff settings shared by every supervised task.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    idle: Duration,
    error: Duration,
}

/// Repeats `step` until shutdown. Successful steps are followed by `pace`,
/// quiet or refused ones by the idle backoff and unexpected failures by the
/// error backoff. A fatal error stops the whole node.
async fn supervise<F, Fut>(
    role: &'static str,
    pace: Duration,
    backoff: Backoff,
    controller: Arc<ShutdownController>,
    mut step: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let cancel = controller.subscribe();
    debug!(role, "Worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = step() => outcome,
        };

        let wait = match outcome {
            Ok(()) => pace,
            Err(e) if e.is_silence() => backoff.idle,
            Err(e) if e.is_fatal() => {
                error!(role, error = %e, "Fatal error, stopping node");
                controller.shutdown();
                break;
            }
            Err(ChainError::Cancelled) => {
                if cancel.is_cancelled() {
                    break;
                }
                debug!(role, "Step cancelled");
                backoff.idle
            }
            Err(e) if e.is_rejection() => {
                warn!(role, error = %e, "Rejected");
                backoff.idle
            }
            Err(e) => {
                error!(role, error = %e, "Step failed, backing off");
                backoff.error
            }
        };

        if !wait.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
    debug!(role, "Worker stopped");
}

pub struct Node {
    config: Config,
    genesis: GenesisBlockData,
    ctx: ChainContext,
    mempool: Mempool,
    controller: Arc<ShutdownController>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Node {
    /// Opens the stores, seeds genesis on first start and spawns the workers.
    pub async fn start(
        config: Config,
        genesis: GenesisBlockData,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if config.node.chain_id != genesis.chain_id {
            return Err(ChainError::Config(format!(
                "node.chain_id {} does not match genesis chain {}",
                config.node.chain_id, genesis.chain_id
            )));
        }

        let stores = if config.node.in_memory {
            Stores::in_memory()
        } else {
            Stores::sqlite(&config.node.data_dir)?
        };
        let coordinator = StoreCoordinator::initialize(stores, &genesis).await?;
        let strategy = strategy_from_config(&config, &genesis)?;

        let ctx = ChainContext {
            coordinator: coordinator.clone(),
            strategy,
            transport,
            locks: KeyedMutex::new(),
            cache: BlockCache::new(config.node.block_cache_size),
            rules: ChainRules::from(&genesis),
        };
        let mempool = Mempool::new(coordinator, genesis.chain_id, config.miner.gas_price);

        let mut node = Self {
            config,
            genesis,
            ctx,
            mempool,
            controller: Arc::new(ShutdownController::new()),
            workers: Vec::new(),
        };
        node.spawn_workers()?;

        info!(
            peer = %node.peer_id(),
            consensus = node.ctx.strategy.name(),
            chain_id = node.genesis.chain_id,
            tip = %hex::encode(node.ctx.coordinator.latest_hash()),
            workers = node.workers.len(),
            "Node started"
        );
        Ok(node)
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let timing = self.config.timing.clone();
        let backoff = Backoff {
            idle: timing.idle_backoff,
            error: timing.error_backoff,
        };

        // Transaction intake.
        {
            let transport = self.ctx.transport.clone();
            let mempool = self.mempool.clone();
            let timeout = timing.receive_timeout;
            self.spawn("mempool", Duration::ZERO, backoff, move || {
                let transport = transport.clone();
                let mempool = mempool.clone();
                async move {
                    let (from, bytes) = transport
                        .next_message(TRANSACTIONS_TOPIC, timeout)
                        .await?
                        .ok_or(ChainError::NetworkSilence)?;
                    let tx: SignedTransaction = decode(&bytes)?;
                    debug!(peer = %from, tx = %tx.hash_str(), "Received transaction");
                    mempool.receive(tx).await
                }
            });
        }

        {
            let mempool = self.mempool.clone();
            self.spawn("drain", timing.drain_interval, backoff, move || {
                let mempool = mempool.clone();
                async move { mempool.drain().await.map(|_| ()) }
            });
        }

        if self.config.miner.enabled {
            if self.ctx.strategy.can_produce() {
                let miner = Arc::new(Miner::new(
                    self.ctx.clone(),
                    self.beneficiary()?,
                    self.controller.subscribe(),
                ));
                self.spawn("miner", timing.mining_interval, backoff, move || {
                    let miner = miner.clone();
                    async move { miner.mine_once().await.map(|_| ()) }
                });
            } else {
                warn!(
                    consensus = self.ctx.strategy.name(),
                    "Mining enabled but this node cannot produce blocks; running as validator only"
                );
            }
        }

        {
            let validator = Arc::new(Validator::new(self.ctx.clone(), timing.receive_timeout));
            self.spawn("validator", Duration::ZERO, backoff, move || {
                let validator = validator.clone();
                async move { validator.receive_once().await.map(|_| ()) }
            });
        }

        if self.config.sync.enabled {
            let client = Arc::new(SyncClient::new(
                self.ctx.clone(),
                self.config.sync.vote_timeout,
                self.config.sync.max_backfill_depth,
            ));
            self.spawn("sync", self.config.sync.sync_interval, backoff, move || {
                let client = client.clone();
                async move {
                    let outcome = client.sync_once().await?;
                    debug!(?outcome, "Sync round finished");
                    Ok(())
                }
            });
        }

        let server = Arc::new(SyncServer::new(self.ctx.clone(), timing.receive_timeout));
        {
            let server = server.clone();
            self.spawn("vote-server", Duration::ZERO, backoff, move || {
                let server = server.clone();
                async move { server.serve_vote_once().await }
            });
        }
        self.spawn("block-server", Duration::ZERO, backoff, move || {
            let server = server.clone();
            async move { server.serve_block_once().await }
        });

        Ok(())
    }

    fn spawn<F, Fut>(&mut self, role: &'static str, pace: Duration, backoff: Backoff, step: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let controller = self.controller.clone();
        let handle = tokio::spawn(supervise(role, pace, backoff, controller, step));
        self.workers.push((role, handle));
    }

    /// Configured beneficiary, else the signer's address, else the genesis
    /// authority's.
    fn beneficiary(&self) -> Result<Address> {
        if let Some(address) = self.config.miner.beneficiary_address()? {
            return Ok(address);
        }
        if let Some(key) = self.config.miner.authority_key()? {
            return Ok(key.address());
        }
        self.genesis.authority_address()
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.transport.local_peer()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn genesis(&self) -> &GenesisBlockData {
        &self.genesis
    }

    pub fn context(&self) -> &ChainContext {
        &self.ctx
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn coordinator(&self) -> &StoreCoordinator {
        &self.ctx.coordinator
    }

    /// Broadcasts a transaction on the transactions topic. This node's own
    /// intake picks it up like any peer's.
    pub async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<()> {
        tx.validate_stateless(self.genesis.chain_id)?;
        self.ctx.transport.publish(TRANSACTIONS_TOPIC, encode(tx)?).await?;
        debug!(tx = %tx.hash_str(), "Submitted transaction");
        Ok(())
    }

    pub async fn account(&self, address: &Address) -> Result<Account> {
        let txn = self.ctx.coordinator.open().await?;
        let account = txn.account(address)?;
        txn.discard();
        Ok(account)
    }

    pub async fn tip(&self) -> Result<ChainTip> {
        let txn = self.ctx.coordinator.open().await?;
        let tip = txn.tip()?;
        txn.discard();
        Ok(tip)
    }

    pub async fn block(&self, hash: &[u8; 32]) -> Result<Option<BlockData>> {
        if let Some(block) = self.ctx.cache.get(hash).await {
            return Ok(Some(block));
        }
        let txn = self.ctx.coordinator.open().await?;
        let block = txn.block(hash)?;
        txn.discard();
        Ok(block)
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.controller.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.controller.is_shutdown()
    }

    pub fn shutdown(&self) {
        self.controller.shutdown();
    }

    /// Resolves once the node has been told to stop, by [`Node::shutdown`]
    /// or a fatal worker error.
    pub async fn stopped(&self) {
        self.controller.subscribe().cancelled().await
    }

    /// Stops every worker and waits for them to exit.
    pub async fn join(self) {
        self.controller.shutdown();
        for (role, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(role, error = %e, "Worker panicked");
            }
        }
        info!(peer = %self.ctx.transport.local_peer(), "Node stopped");
    }
}
