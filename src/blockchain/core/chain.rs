use crate::crypto::Address;
use crate::transaction::BlockTransaction;
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

/// Parent hash of block #1 and value of the "latest hash" pointer while the
/// chain holds nothing but the genesis block.
pub const GENESIS_MARKER: Sha256Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub prev_block_hash: Sha256Hash,
    pub timestamp: u64,
    pub beneficiary: Address,
    pub difficulty: u32,
    pub mining_reward: u64,
    pub state_root: Sha256Hash,
    pub trans_root: Sha256Hash,
    pub tokens_root: Sha256Hash,
    pub nonce: u64,
    pub latest_token_id: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.number.to_le_bytes());
        hasher.update(self.prev_block_hash);
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.beneficiary);
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.mining_reward.to_le_bytes());
        hasher.update(self.state_root);
        hasher.update(self.trans_root);
        hasher.update(self.tokens_root);
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.latest_token_id.to_le_bytes());
        hasher.finalize().into()
    }
}

/// A committed block. Never mutated once persisted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockData {
    pub hash: Sha256Hash,
    pub header: BlockHeader,
    /// Compact authority signature over `hash` (PoA); empty under PoW.
    #[serde(with = "serde_bytes")]
    pub header_signature: Vec<u8>,
    pub transactions: Vec<BlockTransaction>,
    /// Compressed public key of the signer (PoA); empty under PoW.
    #[serde(with = "serde_bytes")]
    pub validator: Vec<u8>,
}

impl BlockData {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn calculate_merkle_root(transactions: &[BlockTransaction]) -> Sha256Hash {
        let leaves: Vec<Sha256Hash> = transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&leaves)
    }

    /// Target for a difficulty expressed in leading zero bits.
    pub fn hash_to_target(difficulty: u32) -> [u8; 32] {
        let mut target = [0xFF; 32];
        let leading_zeros = difficulty.min(256) / 8;
        let partial_bits = difficulty % 8;

        for item in target.iter_mut().take(leading_zeros as usize) {
            *item = 0;
        }

        if leading_zeros < 32 && partial_bits > 0 {
            target[leading_zeros as usize] = 0xFF >> partial_bits;
        }
        target
    }

    pub fn meets_difficulty(hash: &Sha256Hash, difficulty: u32) -> bool {
        *hash <= Self::hash_to_target(difficulty)
    }
}

/// Number of leading zero bits in a hash.
pub fn leading_zero_bits(hash: &Sha256Hash) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Binary merkle tree over leaf hashes. An odd node at any level is paired
/// with itself. The root of an empty tree is all zeroes.
pub fn merkle_root(leaves: &[Sha256Hash]) -> Sha256Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<Sha256Hash> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = if pair.len() == 2 { pair[1] } else { pair[0] };
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hasher.finalize().into()
            })
            .collect();
    }
    level[0]
}

/// Hash and number of the block the next block must extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Sha256Hash,
    pub number: u64,
}

impl ChainTip {
    pub fn genesis() -> Self {
        Self {
            hash: GENESIS_MARKER,
            number: 0,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.hash == GENESIS_MARKER
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}
