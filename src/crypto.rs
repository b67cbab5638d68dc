//! Keys, addresses and signatures
//!
//! Transactions carry 65-byte recoverable signatures so the sender's address
//! is derived from the signature itself. Block headers are signed with plain
//! 64-byte compact signatures and checked against the 33-byte public key the
//! block names as its validator. Every message is SHA-256 hashed before
//! signing.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::{RecoverableSignature, RecoveryId, Signature},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Account address: SHA-256 of the compressed public key.
pub type Address = [u8; 32];

/// The all-zero address stands for "not set".
pub const ZERO_ADDRESS: Address = [0u8; 32];

fn crypto_err(what: &str, detail: impl std::fmt::Display) -> ChainError {
    ChainError::Crypto(format!("{}: {}", what, detail))
}

pub fn address_from_hex(hex_str: &str) -> Result<Address, ChainError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| crypto_err("address is not hex", e))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| crypto_err("address length", format!("expected 32 bytes, got {}", len)))
}

pub fn address_from_public_key(public_key_bytes: &[u8]) -> Address {
    Sha256::digest(public_key_bytes).into()
}

/// Recoverable ECDSA signature split the way it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct RecoverableSig {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl RecoverableSig {
    /// True when no signature has been attached.
    pub fn is_absent(&self) -> bool {
        self.r == [0u8; 32] && self.s == [0u8; 32]
    }

    /// `r ‖ s ‖ v`
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }

    fn compact(&self) -> [u8; COMPACT_SIGNATURE_SIZE] {
        let mut compact = [0u8; COMPACT_SIGNATURE_SIZE];
        compact[..32].copy_from_slice(&self.r);
        compact[32..].copy_from_slice(&self.s);
        compact
    }
}

/// A signing identity. The secret never leaves this type.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self, ChainError> {
        Ok(Self::from_secret(SecretKey::new(&mut OsRng)))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(&SECP, &secret);
        Self { secret, public }
    }

    /// Loads a key from its 32-byte hex form, as written in node configs.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| crypto_err("secret key is not hex", e))?;
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(crypto_err(
                "secret key length",
                format!("expected {} bytes, got {}", SECRET_KEY_SIZE, bytes.len()),
            ));
        }
        let secret = SecretKey::from_slice(&bytes).map_err(|e| crypto_err("secret key", e))?;
        Ok(Self::from_secret(secret))
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.serialize()
    }

    /// Compact signature over SHA-256(`message`). Used for block headers.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = digest(message)?;
        Ok(SECP.sign_ecdsa(&digest, &self.secret).serialize_compact())
    }

    /// Recoverable signature over SHA-256(`message`). Used for transactions.
    pub fn sign_recoverable(&self, message: &[u8]) -> Result<RecoverableSig, ChainError> {
        let digest = digest(message)?;
        let (recovery_id, compact) = SECP
            .sign_ecdsa_recoverable(&digest, &self.secret)
            .serialize_compact();

        let mut sig = RecoverableSig {
            v: recovery_id.to_i32() as u8,
            ..RecoverableSig::default()
        };
        sig.r.copy_from_slice(&compact[..32]);
        sig.s.copy_from_slice(&compact[32..]);
        Ok(sig)
    }
}

fn digest(message: &[u8]) -> Result<Message, ChainError> {
    Message::from_digest_slice(&Sha256::digest(message)).map_err(|e| crypto_err("digest", e))
}

/// Checks a compact header signature against a compressed public key.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(crypto_err(
            "validator key length",
            format!("expected {} bytes, got {}", PUBLIC_KEY_SIZE, public_key_bytes.len()),
        ));
    }
    let public = PublicKey::from_slice(public_key_bytes).map_err(|e| crypto_err("validator key", e))?;
    let signature =
        Signature::from_compact(signature_bytes).map_err(|e| crypto_err("header signature", e))?;

    SECP.verify_ecdsa(&digest(message)?, &signature, &public)
        .map_err(|_| ChainError::Crypto("signature does not match key".to_string()))
}

/// Recovers the address that produced `sig` over `message`.
pub fn recover_address(message: &[u8], sig: &RecoverableSig) -> Result<Address, ChainError> {
    let recovery_id =
        RecoveryId::from_i32(i32::from(sig.v)).map_err(|e| crypto_err("recovery id", e))?;
    let signature = RecoverableSignature::from_compact(&sig.compact(), recovery_id)
        .map_err(|e| crypto_err("recoverable signature", e))?;
    let public = SECP
        .recover_ecdsa(&digest(message)?, &signature)
        .map_err(|e| crypto_err("key recovery", e))?;
    Ok(address_from_public_key(&public.serialize()))
}
