//! Credential-at-rest cipher (C8): AES-256-GCM replacement for the original
//! `cryptography.fernet.Fernet` encryption in
//! `original_source/backend/app/services/encryption.py`. Grounded on
//! `omo-protocol-defi-flow`'s `api::auth::{encrypt_pk, decrypt_pk}` — same
//! crate (`aes-gcm`), same `base64(nonce || ciphertext)` wire format.

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use base64::Engine;
use rand::RngCore;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

pub struct Cipher {
    key: [u8; KEY_LENGTH],
}

impl Cipher {
    /// Load `ENCRYPTION_KEY` (base64-encoded, 32 raw bytes) from the
    /// environment. Fatal if unset or malformed, matching the Python
    /// service's `sys.exit(1)` at import time if `ENCRYPTION_KEY` is absent.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("ENCRYPTION_KEY")
            .context("ENCRYPTION_KEY must be set — refusing to start without a credential cipher")?;
        Self::from_base64(&raw)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("ENCRYPTION_KEY is not valid base64")?;
        if bytes.len() != KEY_LENGTH {
            bail!("ENCRYPTION_KEY must decode to exactly {KEY_LENGTH} bytes, got {}", bytes.len());
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// `base64(nonce[12] || ciphertext || tag[16])`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("credential encryption failed: {e}"))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("encrypted credential is not valid base64")?;
        if data.len() < NONCE_LENGTH + 16 {
            bail!("encrypted credential is too short to contain a nonce and auth tag");
        }

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let nonce = Nonce::from_slice(&data[..NONCE_LENGTH]);
        let ciphertext = &data[NONCE_LENGTH..];

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("credential decryption failed: {e}"))?;
        String::from_utf8(plaintext).context("decrypted credential is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Cipher {
        Cipher {
            key: [7u8; KEY_LENGTH],
        }
    }

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let cipher = test_cipher();
        let encrypted = cipher.encrypt("super-secret-api-key").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "super-secret-api-key");
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let cipher = test_cipher();
        let mut encrypted = cipher.encrypt("value").unwrap();
        encrypted.push('x');
        assert!(cipher.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_malformed_key_length() {
        let short_key = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(Cipher::from_base64(&short_key).is_err());
    }
}
