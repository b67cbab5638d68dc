//! Transaction module split into types and validation for better modularity

pub mod types;
pub mod validation;

pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, RecoverableSig, ZERO_ADDRESS};
    use crate::error::ChainError;

    const CHAIN_ID: u64 = 7;

    fn recipient() -> crate::crypto::Address {
        KeyPair::generate().unwrap().address()
    }

    #[test]
    fn test_signed_coin_transaction_is_valid() {
        let keypair = KeyPair::generate().unwrap();
        let signed = Transaction::coin(CHAIN_ID, 0, keypair.address(), recipient(), 100)
            .sign(&keypair)
            .unwrap();

        assert!(signed.verify_signature().is_ok());
        assert!(signed.validate_stateless(CHAIN_ID).is_ok());
    }

    #[test]
    fn test_signature_from_other_key_fails() {
        let owner = KeyPair::generate().unwrap();
        let thief = KeyPair::generate().unwrap();
        let signed = Transaction::coin(CHAIN_ID, 0, owner.address(), recipient(), 100)
            .sign(&thief)
            .unwrap();

        let err = signed.verify_signature().unwrap_err();
        assert!(matches!(err, ChainError::Validation(_)));
    }

    #[test]
    fn test_unsigned_transaction_fails() {
        let keypair = KeyPair::generate().unwrap();
        let unsigned = SignedTransaction {
            tx: Transaction::coin(CHAIN_ID, 0, keypair.address(), recipient(), 5),
            signature: RecoverableSig::default(),
        };

        assert!(unsigned.verify_signature().is_err());
        let err = unsigned.validate_stateless(CHAIN_ID).unwrap_err();
        assert!(err.to_string().contains("not signed"));
    }

    #[test]
    fn test_stateless_rules_per_type() {
        let keypair = KeyPair::generate().unwrap();
        let from = keypair.address();

        let zero_value = Transaction::coin(CHAIN_ID, 0, from, recipient(), 0)
            .sign(&keypair)
            .unwrap();
        assert!(zero_value.validate_stateless(CHAIN_ID).is_err());

        let no_recipient = Transaction::coin(CHAIN_ID, 0, from, ZERO_ADDRESS, 10)
            .sign(&keypair)
            .unwrap();
        assert!(no_recipient.validate_stateless(CHAIN_ID).is_err());

        let wrong_chain = Transaction::coin(CHAIN_ID + 1, 0, from, recipient(), 10)
            .sign(&keypair)
            .unwrap();
        assert!(wrong_chain.validate_stateless(CHAIN_ID).is_err());

        let no_metadata = Transaction::token(CHAIN_ID, 0, from, recipient(), 42, "  ", 1)
            .sign(&keypair)
            .unwrap();
        assert!(no_metadata.validate_stateless(CHAIN_ID).is_err());

        // Token transactions carry no value; minting to yourself is allowed.
        let mint = Transaction::token(CHAIN_ID, 0, from, ZERO_ADDRESS, 42, "ipfs://meta", 1)
            .sign(&keypair)
            .unwrap();
        assert!(mint.validate_stateless(CHAIN_ID).is_ok());

        let mut valued = Transaction::token(CHAIN_ID, 0, from, ZERO_ADDRESS, 42, "ipfs://meta", 1);
        valued.value = 5;
        let valued = valued.sign(&keypair).unwrap();
        let err = valued.validate_stateless(CHAIN_ID).unwrap_err();
        assert!(err.to_string().contains("coin value"));
    }

    #[test]
    fn test_identity_hash_changes_with_content() {
        let keypair = KeyPair::generate().unwrap();
        let to = recipient();
        let a = Transaction::coin(CHAIN_ID, 0, keypair.address(), to, 10)
            .sign(&keypair)
            .unwrap();
        let b = Transaction::coin(CHAIN_ID, 1, keypair.address(), to, 10)
            .sign(&keypair)
            .unwrap();

        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_pending_costs() {
        let keypair = KeyPair::generate().unwrap();
        let signed = Transaction::coin(CHAIN_ID, 0, keypair.address(), recipient(), 100)
            .with_tip(5)
            .sign(&keypair)
            .unwrap();
        let pending = PendingBlockTransaction::stage(signed.clone(), 1, 3);

        assert_eq!(pending.id(), signed.hash());
        assert_eq!(pending.gas_cost().unwrap(), 3 * TX_GAS_UNITS);
        assert_eq!(pending.total_cost().unwrap(), 108);

        let overflowing = PendingBlockTransaction::stage(signed, 1, u64::MAX);
        assert!(overflowing.total_cost().is_err());
    }

    #[test]
    fn test_bincode_roundtrip() {
        let keypair = KeyPair::generate().unwrap();
        let signed = Transaction::token(CHAIN_ID, 3, keypair.address(), recipient(), 9, "ipfs://x", 2)
            .with_data(vec![1, 2, 3])
            .sign(&keypair)
            .unwrap();

        let bytes = bincode::serialize(&signed).unwrap();
        let decoded: SignedTransaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, signed);

        let block_tx = BlockTransaction::from(PendingBlockTransaction::stage(signed, 10, 1));
        let bytes = bincode::serialize(&block_tx).unwrap();
        let decoded: BlockTransaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, block_tx);
    }
}
