//! Encrypted local database backend.
//!
//! The default backend: secrets are AES-256-GCM encrypted and stored in a
//! dedicated column-family database next to the control plane's own data.
//! No external service is required.
//!
//! The value layout is `nonce (12 bytes) || ciphertext`, where the plaintext
//! is the JSON encoding of the secret map.

use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Result, SecretsError};
use crate::{SecretMap, SecretsBackend};

const NONCE_LEN: usize = 12;

/// Derive a 32-byte AES key from the raw `ENCRYPTION_KEY` value.
///
/// A 64-character hex string is used verbatim; anything else is hashed with
/// SHA-256 so operators may configure a passphrase.
///
/// # Errors
///
/// Returns [`SecretsError::Config`] when no key material is configured.
pub fn derive_key(raw: Option<&str>) -> Result<[u8; 32]> {
    let raw = raw
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SecretsError::Config("ENCRYPTION_KEY is not set".into()))?;

    if raw.len() == 64 {
        if let Ok(bytes) = hex::decode(raw) {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
    }

    let digest = Sha256::digest(raw.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}

/// AES-256-GCM encrypted database backend.
pub struct EncryptedDbBackend {
    db: Arc<rocksdb::DB>,
    cipher: Aes256Gcm,
}

impl EncryptedDbBackend {
    /// Open (or create) the encrypted database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, key: [u8; 32]) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path)
            .map_err(|e| SecretsError::Database(e.to_string()))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(Self {
            db: Arc::new(db),
            cipher,
        })
    }

    fn encrypt(&self, path: &str, data: &SecretMap) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(data)
            .map_err(|e| SecretsError::Malformed(path.to_string(), e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| SecretsError::Database("encryption failure".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, path: &str, value: &[u8]) -> Result<SecretMap> {
        if value.len() <= NONCE_LEN {
            return Err(SecretsError::Decrypt(path.to_string()));
        }
        let (nonce, ciphertext) = value.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretsError::Decrypt(path.to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| SecretsError::Malformed(path.to_string(), e.to_string()))
    }
}

#[async_trait]
impl SecretsBackend for EncryptedDbBackend {
    async fn get(&self, path: &str) -> Result<SecretMap> {
        let value = self
            .db
            .get(path.as_bytes())
            .map_err(|e| SecretsError::Database(e.to_string()))?
            .ok_or_else(|| SecretsError::NotFound(path.to_string()))?;
        self.decrypt(path, &value)
    }

    async fn set(&self, path: &str, data: SecretMap) -> Result<()> {
        let value = self.encrypt(path, &data)?;
        self.db
            .put(path.as_bytes(), value)
            .map_err(|e| SecretsError::Database(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.db
            .delete(path.as_bytes())
            .map_err(|e| SecretsError::Database(e.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mode = rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut paths = Vec::new();
        for item in self.db.iterator(mode) {
            let (key, _) = item.map_err(|e| SecretsError::Database(e.to_string()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if let Ok(path) = std::str::from_utf8(&key) {
                paths.push(path.to_string());
            }
        }
        Ok(paths)
    }
}
