//! # Secret Sealing
//!
//! XChaCha20-Poly1305 encryption of queued secrets under a key that lives
//! only as long as the process (unless one is supplied explicitly).
//!
//! Sealed secrets keep plaintext preimages out of persisted snapshots,
//! crash dumps and debug output. This does not replace secure key storage.

use crate::domain::{SealedSecret, SecureSecret, SwapError};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric sealing key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretSealer {
    key: [u8; 32],
}

impl SecretSealer {
    /// Fresh random process-lifetime key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Use a caller-provided 32-byte key (hex), e.g. to reopen a snapshot.
    pub fn from_hex(key_hex: &str) -> Result<Self, SwapError> {
        let mut bytes = hex::decode(key_hex)
            .map_err(|e| SwapError::InvalidParameter(format!("sealing key: {e}")))?;
        let key = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| SwapError::InvalidParameter("sealing key must be 32 bytes".into()));
        bytes.zeroize();
        Ok(Self { key: key? })
    }

    /// Encrypt a secret.
    pub fn seal(&self, secret: &SecureSecret) -> Result<SealedSecret, SwapError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), secret.as_bytes().as_slice())
            .map_err(|e| SwapError::Storage(format!("seal failed: {e}")))?;
        Ok(SealedSecret { nonce, ciphertext })
    }

    /// Decrypt at the point of use.
    pub fn unseal(&self, sealed: &SealedSecret) -> Result<SecureSecret, SwapError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut plain = cipher
            .decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|_| SwapError::Storage("unseal failed: wrong key or tampered secret".into()))?;
        let secret = SecureSecret::from_slice(&plain);
        plain.zeroize();
        secret.ok_or_else(|| SwapError::Storage("unsealed secret has wrong length".into()))
    }
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretSealer(***)")
    }
}
