//! Shared helpers for the integration tests
#![allow(dead_code)]

use authority_chain::blockchain::{Account, BlockData, ChainTip, LedgerView, Token};
use authority_chain::cache::BlockCache;
use authority_chain::consensus::{ConsensusStrategy, ProofOfAuthority, ProofOfWork};
use authority_chain::context::{ChainContext, ChainRules};
use authority_chain::crypto::{Address, KeyPair};
use authority_chain::genesis::GenesisBlockData;
use authority_chain::keyed_mutex::KeyedMutex;
use authority_chain::mempool::Mempool;
use authority_chain::miner::Miner;
use authority_chain::network::LocalNetwork;
use authority_chain::shutdown::CancelSignal;
use authority_chain::store::{StoreCoordinator, Stores};
use authority_chain::sync::SyncServer;
use authority_chain::transaction::{SignedTransaction, Transaction};
use authority_chain::validator::Validator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const CHAIN_ID: u64 = 1;
pub const TIMEOUT: Duration = Duration::from_millis(200);

/// Genesis authority key (secret key 1).
pub fn authority() -> KeyPair {
    KeyPair::from_secret_hex("0000000000000000000000000000000000000000000000000000000000000001")
        .unwrap()
}

/// Pre-funded genesis account (secret key 2).
pub fn coinbase() -> KeyPair {
    KeyPair::from_secret_hex("0000000000000000000000000000000000000000000000000000000000000002")
        .unwrap()
}

pub fn genesis() -> GenesisBlockData {
    GenesisBlockData::embedded().unwrap()
}

pub fn poa(signer: Option<KeyPair>) -> Arc<dyn ConsensusStrategy> {
    Arc::new(ProofOfAuthority::new(genesis().authority_bytes().unwrap(), signer).unwrap())
}

pub fn pow(difficulty: u32) -> Arc<dyn ConsensusStrategy> {
    Arc::new(ProofOfWork::new(difficulty))
}

pub fn transfer(from: &KeyPair, nonce: u64, to: Address, value: u64) -> SignedTransaction {
    Transaction::coin(CHAIN_ID, nonce, from.address(), to, value)
        .sign(from)
        .unwrap()
}

/// One chain participant wired from components, without the worker loops.
pub struct Harness {
    pub ctx: ChainContext,
    pub mempool: Mempool,
}

impl Harness {
    pub async fn new(
        network: &LocalNetwork,
        peer: &str,
        strategy: Arc<dyn ConsensusStrategy>,
        stores: Stores,
    ) -> Self {
        let genesis = genesis();
        let coordinator = StoreCoordinator::initialize(stores, &genesis).await.unwrap();
        let ctx = ChainContext {
            coordinator: coordinator.clone(),
            strategy,
            transport: network.join(peer),
            locks: KeyedMutex::new(),
            cache: BlockCache::default(),
            rules: ChainRules::from(&genesis),
        };
        let mempool = Mempool::new(coordinator, CHAIN_ID, 0);
        Self { ctx, mempool }
    }

    pub async fn in_memory(network: &LocalNetwork, peer: &str, strategy: Arc<dyn ConsensusStrategy>) -> Self {
        Self::new(network, peer, strategy, Stores::in_memory()).await
    }

    pub fn miner(&self, beneficiary: Address) -> Miner {
        Miner::new(self.ctx.clone(), beneficiary, CancelSignal::never())
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.ctx.clone(), TIMEOUT)
    }

    /// Receives, drains and mines `txs` into one block.
    pub async fn mine(&self, beneficiary: Address, txs: &[SignedTransaction]) -> BlockData {
        for tx in txs {
            self.mempool.receive(tx.clone()).await.unwrap();
        }
        self.mempool.drain().await.unwrap();
        self.miner(beneficiary)
            .mine_once()
            .await
            .unwrap()
            .expect("pending buffer was empty")
    }

    pub async fn account(&self, address: &Address) -> Account {
        let txn = self.ctx.coordinator.open().await.unwrap();
        let account = txn.account(address).unwrap();
        txn.discard();
        account
    }

    pub async fn token(&self, id: u64) -> Option<Token> {
        let txn = self.ctx.coordinator.open().await.unwrap();
        let token = txn.token(id).unwrap();
        txn.discard();
        token
    }

    pub async fn tip(&self) -> ChainTip {
        let txn = self.ctx.coordinator.open().await.unwrap();
        let tip = txn.tip().unwrap();
        txn.discard();
        tip
    }

    /// Answers vote and block requests until the handles are aborted.
    pub fn serve(&self) -> Vec<JoinHandle<()>> {
        let server = Arc::new(SyncServer::new(self.ctx.clone(), TIMEOUT));
        let votes = server.clone();
        vec![
            tokio::spawn(async move {
                loop {
                    let _ = votes.serve_vote_once().await;
                }
            }),
            tokio::spawn(async move {
                loop {
                    let _ = server.serve_block_once().await;
                }
            }),
        ]
    }
}
