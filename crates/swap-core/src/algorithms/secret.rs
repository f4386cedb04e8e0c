//! # Secret Vault
//!
//! Generation and validation of the shared swap secret and its hash-lock.
//!
//! Validation compares full SHA-256 digests in constant time, never the
//! secret bytes themselves, so a partial match leaks nothing through timing.

use crate::domain::{Hash, SecureSecret, SwapError};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Secret and hash-lock operations.
pub struct SecretVault;

impl SecretVault {
    /// Fresh 32-byte secret from the OS CSPRNG, and `SHA-256(secret)`.
    pub fn generate() -> (SecureSecret, Hash) {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let secret = SecureSecret::new(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        let hash_lock = Self::hash_lock(secret.as_bytes());
        (secret, hash_lock)
    }

    /// SHA-256 of a preimage.
    pub fn hash_lock(secret: &[u8]) -> Hash {
        Sha256::digest(secret).into()
    }

    /// Hex hash-lock, for logs and display.
    pub fn hash_lock_hex(secret: &[u8]) -> String {
        hex::encode(Self::hash_lock(secret))
    }

    /// True iff `SHA-256(secret) == hash_lock` and the secret is 32 bytes.
    pub fn validate(secret: &[u8], hash_lock: &Hash) -> bool {
        if secret.len() != 32 {
            return false;
        }
        Self::hash_lock(secret).ct_eq(hash_lock).into()
    }

    /// [`SecretVault::validate`] as a `Result`.
    pub fn ensure_valid(secret: &SecureSecret, hash_lock: &Hash) -> Result<(), SwapError> {
        if Self::validate(secret.as_bytes(), hash_lock) {
            Ok(())
        } else {
            Err(SwapError::InvalidSecret)
        }
    }
}
