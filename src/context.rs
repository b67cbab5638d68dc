//! Handles shared by the miner, validator and synchronizer.

use crate::cache::BlockCache;
use crate::consensus::ConsensusStrategy;
use crate::genesis::GenesisBlockData;
use crate::keyed_mutex::KeyedMutex;
use crate::network::Transport;
use crate::store::StoreCoordinator;
use std::sync::Arc;

/// Chain-wide constants every block is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRules {
    pub chain_id: u64,
    pub mining_reward: u64,
}

impl From<&GenesisBlockData> for ChainRules {
    fn from(genesis: &GenesisBlockData) -> Self {
        Self {
            chain_id: genesis.chain_id,
            mining_reward: genesis.mining_reward,
        }
    }
}

#[derive(Clone)]
pub struct ChainContext {
    pub coordinator: StoreCoordinator,
    pub strategy: Arc<dyn ConsensusStrategy>,
    pub transport: Arc<dyn Transport>,
    pub locks: KeyedMutex,
    pub cache: BlockCache,
    pub rules: ChainRules,
}
