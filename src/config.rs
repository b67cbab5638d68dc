//! Configuration management for AuthorityChain

use crate::crypto::{address_from_hex, Address, KeyPair};
use crate::error::ChainError;
use crate::logging::LogFormat;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub miner: MinerConfig,
    pub sync: SyncConfig,
    pub timing: TimingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    Poa,
    Pow,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain_id: u64,
    pub consensus: ConsensusKind,
    pub data_dir: PathBuf,
    /// Keep every table in memory instead of SQLite.
    pub in_memory: bool,
    pub block_cache_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            consensus: ConsensusKind::Poa,
            data_dir: PathBuf::from("./data"),
            in_memory: false,
            block_cache_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub enabled: bool,
    /// Secret key of the genesis authority; only the authority mines under PoA.
    pub authority_key_hex: Option<String>,
    /// Hex address credited with rewards and fees. Defaults to the
    /// authority's address under PoA.
    pub beneficiary: Option<String>,
    /// Leading zero bits required under PoW.
    pub difficulty: u32,
    pub gas_price: u64,
}

impl MinerConfig {
    pub fn authority_key(&self) -> Result<Option<KeyPair>, ChainError> {
        self.authority_key_hex
            .as_deref()
            .map(KeyPair::from_secret_hex)
            .transpose()
            .map_err(|e| ChainError::Config(format!("miner.authority_key_hex: {}", e)))
    }

    pub fn beneficiary_address(&self) -> Result<Option<Address>, ChainError> {
        self.beneficiary
            .as_deref()
            .map(address_from_hex)
            .transpose()
            .map_err(|e| ChainError::Config(format!("miner.beneficiary: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    #[serde(with = "humantime_duration")]
    pub vote_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub sync_interval: Duration,
    pub max_backfill_depth: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vote_timeout: Duration::from_secs(60),
            sync_interval: Duration::from_secs(10),
            max_backfill_depth: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Sleep after a quiet network poll.
    #[serde(with = "humantime_duration")]
    pub idle_backoff: Duration,
    /// Sleep after an unexpected error.
    #[serde(with = "humantime_duration")]
    pub error_backoff: Duration,
    #[serde(with = "humantime_duration")]
    pub receive_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub drain_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub mining_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(1),
            drain_interval: Duration::from_secs(1),
            mining_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
        }
    }
}

/// Durations written as humantime strings ("500ms", "1m").
mod humantime_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ChainError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ChainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate critical values
    pub fn validate(&self) -> Result<(), ChainError> {
        if !self.node.in_memory && self.node.data_dir.as_os_str().is_empty() {
            return Err(ChainError::Config("node.data_dir must be set".to_string()));
        }
        if self.node.consensus == ConsensusKind::Pow && self.miner.difficulty > 64 {
            return Err(ChainError::Config(format!(
                "miner.difficulty {} is unreasonably high",
                self.miner.difficulty
            )));
        }
        if self.sync.max_backfill_depth == 0 {
            return Err(ChainError::Config(
                "sync.max_backfill_depth must be positive".to_string(),
            ));
        }
        if self.sync.vote_timeout.is_zero() || self.timing.receive_timeout.is_zero() {
            return Err(ChainError::Config("timeouts must be non-zero".to_string()));
        }
        self.miner.authority_key()?;
        self.miner.beneficiary_address()?;
        Ok(())
    }
}

/// Loads `path`, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> Result<Config, ChainError> {
    match fs::read_to_string(path) {
        Ok(text) => Config::from_toml(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(ChainError::Config(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}
