//! Embedded genesis document
//!
//! The genesis block is never stored as block data. It defines the chain id,
//! the pre-funded accounts, the per-block mining reward and the authority key
//! every proof-of-authority block must be signed with.

use crate::crypto::{address_from_hex, address_from_public_key, Address};
use crate::error::ChainError;
use secp256k1::{constants::PUBLIC_KEY_SIZE, PublicKey};
use serde::Deserialize;
use std::collections::BTreeMap;

const EMBEDDED_GENESIS: &str = include_str!("genesis.json");

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenesisBlockData {
    pub chain_id: u64,
    pub timestamp: u64,
    /// Compressed secp256k1 public key of the block authority, hex encoded.
    pub authority: String,
    pub mining_reward: u64,
    /// Opening balances keyed by hex address.
    #[serde(default)]
    pub balances: BTreeMap<String, u64>,
}

impl GenesisBlockData {
    /// The genesis document compiled into the binary.
    pub fn embedded() -> Result<Self, ChainError> {
        Self::from_json(EMBEDDED_GENESIS)
    }

    pub fn from_json(json: &str) -> Result<Self, ChainError> {
        let genesis: GenesisBlockData = serde_json::from_str(json)
            .map_err(|e| ChainError::Config(format!("Invalid genesis document: {}", e)))?;
        genesis.validate()?;
        Ok(genesis)
    }

    fn validate(&self) -> Result<(), ChainError> {
        self.authority_bytes()?;
        self.opening_balances()?;
        Ok(())
    }

    pub fn authority_bytes(&self) -> Result<Vec<u8>, ChainError> {
        let bytes = hex::decode(&self.authority)
            .map_err(|e| ChainError::Config(format!("Genesis authority is not hex: {}", e)))?;
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(ChainError::Config(format!(
                "Genesis authority must be a {}-byte compressed key, got {} bytes",
                PUBLIC_KEY_SIZE,
                bytes.len()
            )));
        }
        PublicKey::from_slice(&bytes)
            .map_err(|e| ChainError::Config(format!("Genesis authority is not a valid key: {}", e)))?;
        Ok(bytes)
    }

    pub fn authority_address(&self) -> Result<Address, ChainError> {
        Ok(address_from_public_key(&self.authority_bytes()?))
    }

    /// Opening balances with decoded addresses, zero balances skipped.
    pub fn opening_balances(&self) -> Result<Vec<(Address, u64)>, ChainError> {
        self.balances
            .iter()
            .filter(|(_, balance)| **balance > 0)
            .map(|(addr, balance)| {
                address_from_hex(addr)
                    .map(|address| (address, *balance))
                    .map_err(|e| ChainError::Config(format!("Genesis balance for {}: {}", addr, e)))
            })
            .collect()
    }
}
