//! Block proofs
//!
//! [`ConsensusStrategy`] is the seam between block assembly and the proof a
//! block carries. [`ProofOfAuthority`] signs the header hash with the genesis
//! authority key; [`ProofOfWork`] searches for a header nonce below a target.

use crate::blockchain::{leading_zero_bits, BlockData, BlockHeader, Sha256Hash};
use crate::config::{Config, ConsensusKind};
use crate::crypto::{verify_signature, KeyPair};
use crate::error::{ChainError, Result};
use crate::genesis::GenesisBlockData;
use std::sync::Arc;
use tracing::debug;

/// A header with its proof attached, ready to become [`BlockData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal {
    pub header: BlockHeader,
    pub hash: Sha256Hash,
    pub header_signature: Vec<u8>,
    pub validator: Vec<u8>,
}

pub trait ConsensusStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this node holds what it needs to produce blocks.
    fn can_produce(&self) -> bool;

    /// Fills the proof-specific header fields of a fresh candidate.
    fn build_candidate(&self, header: &mut BlockHeader);

    /// Seals the candidate. May run for a long time; `should_abort` is polled
    /// between attempts and a `true` ends the search with `Cancelled`.
    fn finalize_proof(&self, header: BlockHeader, should_abort: &dyn Fn() -> bool) -> Result<Seal>;

    /// Checks the proof carried by a received block.
    fn verify_proof(&self, block: &BlockData) -> Result<()>;
}

pub struct ProofOfAuthority {
    authority: Vec<u8>,
    signer: Option<KeyPair>,
}

impl ProofOfAuthority {
    /// `signer` must be the authority's own key when given.
    pub fn new(authority: Vec<u8>, signer: Option<KeyPair>) -> Result<Self> {
        if let Some(keypair) = &signer {
            if keypair.public_key_bytes().as_slice() != authority.as_slice() {
                return Err(ChainError::Config(format!(
                    "signing key {} is not the genesis authority {}",
                    hex::encode(keypair.public_key_bytes()),
                    hex::encode(&authority)
                )));
            }
        }
        Ok(Self { authority, signer })
    }

    pub fn authority(&self) -> &[u8] {
        &self.authority
    }
}

impl ConsensusStrategy for ProofOfAuthority {
    fn name(&self) -> &'static str {
        "poa"
    }

    fn can_produce(&self) -> bool {
        self.signer.is_some()
    }

    fn build_candidate(&self, header: &mut BlockHeader) {
        header.difficulty = 0;
        header.nonce = 0;
    }

    fn finalize_proof(&self, header: BlockHeader, _should_abort: &dyn Fn() -> bool) -> Result<Seal> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            ChainError::Config("this node holds no authority key and cannot sign blocks".to_string())
        })?;
        let hash = header.hash();
        let signature = signer.sign(&hash)?;
        Ok(Seal {
            header,
            hash,
            header_signature: signature.to_vec(),
            validator: signer.public_key_bytes().to_vec(),
        })
    }

    fn verify_proof(&self, block: &BlockData) -> Result<()> {
        verify_signature(&block.validator, &block.hash, &block.header_signature).map_err(|e| {
            ChainError::InvalidProof(format!("header signature of {}: {}", block.hash_hex(), e))
        })?;

        if block.validator != self.authority {
            return Err(ChainError::AuthorityMismatch {
                claimed: hex::encode(&block.validator),
                expected: hex::encode(&self.authority),
            });
        }
        Ok(())
    }
}

pub struct ProofOfWork {
    difficulty: u32,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> Self {
        Self { difficulty }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }
}

impl ConsensusStrategy for ProofOfWork {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn can_produce(&self) -> bool {
        true
    }

    fn build_candidate(&self, header: &mut BlockHeader) {
        header.difficulty = self.difficulty;
        header.nonce = 0;
    }

    fn finalize_proof(&self, mut header: BlockHeader, should_abort: &dyn Fn() -> bool) -> Result<Seal> {
        let mut attempts: u64 = 0;
        loop {
            if should_abort() {
                debug!(attempts, "Proof-of-work search aborted");
                return Err(ChainError::Cancelled);
            }

            let hash = header.hash();
            if BlockData::meets_difficulty(&hash, header.difficulty) {
                debug!(
                    attempts,
                    nonce = header.nonce,
                    zero_bits = leading_zero_bits(&hash),
                    "Proof-of-work found"
                );
                return Ok(Seal {
                    header,
                    hash,
                    header_signature: Vec::new(),
                    validator: Vec::new(),
                });
            }

            attempts += 1;
            header.nonce = header.nonce.checked_add(1).ok_or_else(|| {
                ChainError::InvalidProof("nonce space exhausted".to_string())
            })?;
        }
    }

    fn verify_proof(&self, block: &BlockData) -> Result<()> {
        if block.header.difficulty != self.difficulty {
            return Err(ChainError::InvalidProof(format!(
                "block {} claims difficulty {}, chain requires {}",
                block.hash_hex(),
                block.header.difficulty,
                self.difficulty
            )));
        }
        let hash = block.header.hash();
        if hash != block.hash {
            return Err(ChainError::InvalidProof(format!(
                "declared hash {} does not match header",
                block.hash_hex()
            )));
        }
        if !BlockData::meets_difficulty(&hash, self.difficulty) {
            return Err(ChainError::InvalidProof(format!(
                "hash {} has {} leading zero bits, needs {}",
                block.hash_hex(),
                leading_zero_bits(&hash),
                self.difficulty
            )));
        }
        Ok(())
    }
}

/// Picks the strategy named by `[node].consensus`.
pub fn strategy_from_config(
    config: &Config,
    genesis: &GenesisBlockData,
) -> Result<Arc<dyn ConsensusStrategy>> {
    Ok(match config.node.consensus {
        ConsensusKind::Poa => Arc::new(ProofOfAuthority::new(
            genesis.authority_bytes()?,
            config.miner.authority_key()?,
        )?),
        ConsensusKind::Pow => Arc::new(ProofOfWork::new(config.miner.difficulty)),
    })
}
