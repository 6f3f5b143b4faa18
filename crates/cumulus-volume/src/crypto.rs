//! Block encryption
//!
//! AES-256-GCM with a fresh random 96-bit nonce per block. The nonce is
//! prepended to the ciphertext so a block is self-describing.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use cumulus_common::{Error, Result};
use rand::RngCore;
use std::path::Path;
use tracing::error;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Cipher applied to block payloads of encrypted volumes
#[derive(Clone)]
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    /// Cipher over a raw 32-byte key
    ///
    /// # Errors
    /// Returns `Error::Encryption` if the key is not 32 bytes long.
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            Error::Encryption(format!("key must be {KEY_LEN} bytes, got {}", key.len()))
        })?;
        Ok(Self { cipher })
    }

    /// Cipher over the key stored in `path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or holds a key of the
    /// wrong length.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let key = std::fs::read(path).map_err(|e| {
            error!("Could not read the encryption key {}: {}", path.display(), e);
            Error::Encryption(format!("cannot read key {}: {e}", path.display()))
        })?;
        Self::new(&key)
    }

    /// Random key suitable for [`BlockCipher::new`]
    #[must_use]
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt `plaintext` into `nonce || ciphertext`
    ///
    /// # Errors
    /// Returns `Error::Encryption` if sealing fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt a payload produced by [`BlockCipher::encrypt`]
    ///
    /// # Errors
    /// Returns `Error::Encryption` if the payload is truncated or fails
    /// authentication.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            return Err(Error::Encryption(format!(
                "payload of {} bytes is shorter than the nonce",
                payload.len()
            )));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::Encryption("authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_prepended_and_fresh() {
        let cipher = BlockCipher::new(&BlockCipher::generate_key()).unwrap();
        let a = cipher.encrypt(b"block").unwrap();
        let b = cipher.encrypt(b"block").unwrap();

        assert_eq!(a.len(), NONCE_LEN + 5 + TAG_LEN);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"block");
    }

    #[test]
    fn test_tampering_is_detected() {
        let cipher = BlockCipher::new(&BlockCipher::generate_key()).unwrap();
        let mut sealed = cipher.encrypt(b"block").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;

        assert_eq!(cipher.decrypt(&sealed).unwrap_err().code(), "ENC-001");
        assert!(cipher.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_wrong_key_length() {
        assert!(BlockCipher::new(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_key_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("encryption.key");
        std::fs::write(&path, BlockCipher::generate_key()).unwrap();
        assert!(BlockCipher::from_key_file(&path).is_ok());
        assert!(BlockCipher::from_key_file(&dir.path().join("missing")).is_err());
    }
}
