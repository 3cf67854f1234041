//! AES-256-GCM encryption for secrets at rest.
//!
//! The key is derived once from the site-wide master secret with SHA-256 and
//! is never stored. Every call draws a fresh 96-bit nonce which is prefixed to
//! the ciphertext, so one stored string carries everything needed to decrypt.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Base64 of `nonce || ciphertext || tag`.
///
/// Stores accept only this type for secret columns, so a plaintext token
/// cannot be written by mistake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(String);

impl Ciphertext {
    /// Wraps a value previously produced by [`SecretCipher::encrypt`] and
    /// read back from storage.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ciphertext({} bytes)", self.0.len())
    }
}

/// Symmetric cipher keyed from the site secret.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCipher(<key>)")
    }
}

impl SecretCipher {
    /// Derives the AES key from the site secret.
    ///
    /// # Returns
    /// * `Err` - If the secret is empty
    pub fn from_site_secret(site_secret: &str) -> Result<Self> {
        if site_secret.trim().is_empty() {
            return Err(anyhow!("Site secret must not be empty"));
        }

        let digest = Sha256::digest(site_secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);

        Ok(Self { key })
    }

    /// Encrypts plaintext with a random nonce.
    ///
    /// Two calls with the same plaintext never return the same ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<Ciphertext> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        // Never reuse a nonce under the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);

        Ok(Ciphertext(BASE64.encode(blob)))
    }

    /// Decrypts a value produced by [`SecretCipher::encrypt`].
    ///
    /// # Returns
    /// * `Err` - Wrong key, truncated input, or tampered data
    pub fn decrypt(&self, ciphertext: &Ciphertext) -> Result<String> {
        let blob = BASE64
            .decode(ciphertext.as_str())
            .context("Failed to decode ciphertext")?;

        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(anyhow!(
                "Ciphertext too short: expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                blob.len()
            ));
        }

        let (nonce_bytes, sealed) = blob.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }
}
