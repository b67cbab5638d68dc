//! Error types for AuthorityChain

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// Malformed, unsigned or under-collateralized transaction.
    #[error("Invalid transaction: {0}")]
    Validation(String),

    /// Proposed block signed by a key other than the genesis authority.
    #[error("Authority mismatch: block signed by {claimed}, genesis authority is {expected}")]
    AuthorityMismatch { claimed: String, expected: String },

    /// Local tip disagrees with the peer majority in a way that cannot be
    /// resolved by a forward backfill.
    #[error("Consensus divergence: {0}")]
    ConsensusDivergence(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Nothing was received, or there is nobody to talk to. Not a failure.
    #[error("Network silence")]
    NetworkSilence,

    /// A persisted record no longer decodes. Continuing would risk silent
    /// consensus corruption.
    #[error("Corrupted record in {table}: {reason}")]
    Corruption { table: &'static str, reason: String },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// The chain tip moved while a candidate block was being sealed.
    #[error("Chain tip moved from {expected} to {actual} during mining")]
    StaleTip { expected: String, actual: String },
}

impl ChainError {
    /// Errors that must stop the node rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Corruption { .. })
    }

    pub fn is_silence(&self) -> bool {
        matches!(self, ChainError::NetworkSilence)
    }

    /// A single transaction or block was refused. The worker moves on to the
    /// next input instead of backing off.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChainError::Validation(_)
                | ChainError::AuthorityMismatch { .. }
                | ChainError::InvalidBlock(_)
                | ChainError::InvalidProof(_)
                | ChainError::Serialization(_)
                | ChainError::StaleTip { .. }
        )
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::Storage(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Storage(err.to_string())
    }
}

impl From<secp256k1::Error> for ChainError {
    fn from(err: secp256k1::Error) -> Self {
        ChainError::Crypto(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_corruption_is_fatal() {
        let corrupt = ChainError::Corruption {
            table: "blocks",
            reason: "truncated".to_string(),
        };
        assert!(corrupt.is_fatal());
        assert!(!ChainError::Storage("locked".to_string()).is_fatal());
        assert!(!ChainError::NetworkSilence.is_fatal());
        assert!(ChainError::NetworkSilence.is_silence());
        assert!(ChainError::InvalidBlock("gap".to_string()).is_rejection());
        assert!(!ChainError::Storage("locked".to_string()).is_rejection());
    }

    #[test]
    fn test_display_messages() {
        let err = ChainError::Validation("value must be positive".to_string());
        assert_eq!(err.to_string(), "Invalid transaction: value must be positive");

        let err = ChainError::AuthorityMismatch {
            claimed: "02aa".to_string(),
            expected: "02bb".to_string(),
        };
        assert!(err.to_string().contains("genesis authority is 02bb"));
    }
}
