//! AES-256-GCM envelope for upstream credentials stored in the ledger.
//!
//! Format: `aes256:<base64(nonce || ciphertext)>`.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use std::path::Path;

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

const PREFIX: &str = "aes256:";

/// Seals and opens stored API keys.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Fresh random key, not persisted.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Load the key file, generating it on first use.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let key_bytes = std::fs::read(path)?;
            let key: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("AES key must be exactly 32 bytes, got {}", key_bytes.len())
            })?;
            return Ok(Self { key });
        }

        let cipher = Self::random();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, cipher.key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(path = %path.display(), "Generated credential key");
        Ok(cipher)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.aead()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        let encoded = base64::engine::general_purpose::STANDARD.encode(&combined);
        Ok(format!("{PREFIX}{encoded}"))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let encoded = envelope
            .strip_prefix(PREFIX)
            .ok_or_else(|| Error::Crypto("missing aes256: prefix".into()))?;
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("invalid base64: {e}")))?;
        if combined.len() < NONCE_SIZE {
            return Err(Error::Crypto("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| Error::Crypto(format!("invalid UTF-8: {e}")))
    }

    fn aead(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))
    }
}
