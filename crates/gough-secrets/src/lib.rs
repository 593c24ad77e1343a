//! Pluggable secrets storage for gough.
//!
//! The control plane never persists raw secret material (CA private keys,
//! cloud credentials, webhook secrets) in its relational store; it stores
//! `/`-delimited logical paths and resolves them through a [`SecretsBackend`].
//!
//! Backends are registered by name and selected with the `SECRETS_BACKEND`
//! environment variable. Callers never branch on the backend type.
//!
//! # Backends
//!
//! - `encrypted-db` (default): AES-256-GCM encrypted values in a local
//!   column-family database. Works with no external service.
//! - `vault`: HashiCorp Vault KV v2.
//! - `azure-keyvault`: Azure Key Vault secrets (logical paths are
//!   normalized to the vault's restricted name alphabet).
//!
//! # Example
//!
//! ```no_run
//! use gough_secrets::{SecretsConfig, SecretsRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SecretsConfig {
//!     backend: "encrypted-db".to_string(),
//!     encryption_key: Some("super secret".to_string()),
//!     data_dir: Some("/data/gough/secrets".into()),
//!     ..SecretsConfig::default()
//! };
//!
//! let secrets = SecretsRegistry::with_defaults().create(&config)?;
//! let value = secrets.get("cloud/aws/credentials").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod azure;
pub mod encrypted;
pub mod error;
pub mod paths;
pub mod vault;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use error::{Result, SecretsError};

/// A secret value: a flat map of named fields.
pub type SecretMap = serde_json::Map<String, serde_json::Value>;

/// The contract every secrets backend satisfies.
///
/// Paths are `/`-delimited logical paths (e.g. `cloud/aws/credentials`).
/// Backends with restricted name alphabets normalize at their own boundary;
/// callers never see normalized names.
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Retrieve a secret by path.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::NotFound`] if no secret exists at `path`.
    async fn get(&self, path: &str) -> Result<SecretMap>;

    /// Store or replace a secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot persist the value.
    async fn set(&self, path: &str, data: SecretMap) -> Result<()>;

    /// Delete a secret. Deleting a missing secret is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot perform the deletion.
    async fn delete(&self, path: &str) -> Result<()>;

    /// List secret paths under a prefix. An empty prefix lists everything.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot enumerate secrets.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Configuration for constructing a secrets backend.
#[derive(Debug, Clone, Default)]
pub struct SecretsConfig {
    /// Backend name (`encrypted-db`, `vault`, `azure-keyvault`).
    pub backend: String,
    /// Raw `ENCRYPTION_KEY` value for the encrypted backend.
    pub encryption_key: Option<String>,
    /// Directory for the encrypted backend's database.
    pub data_dir: Option<PathBuf>,
    /// `VAULT_ADDR` for the Vault backend.
    pub vault_addr: Option<String>,
    /// `VAULT_TOKEN` for the Vault backend.
    pub vault_token: Option<String>,
    /// KV v2 mount point, default `secret`.
    pub vault_mount: Option<String>,
    /// `AZURE_VAULT_URL` for the Key Vault backend.
    pub azure_vault_url: Option<String>,
    /// OAuth access token for the Key Vault backend.
    pub azure_access_token: Option<String>,
}

impl SecretsConfig {
    /// Load the configuration from process environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            backend: std::env::var("SECRETS_BACKEND").unwrap_or_else(|_| "encrypted-db".into()),
            encryption_key: std::env::var("ENCRYPTION_KEY").ok(),
            data_dir: std::env::var("DATA_DIR")
                .ok()
                .map(|d| PathBuf::from(d).join("secrets")),
            vault_addr: std::env::var("VAULT_ADDR").ok(),
            vault_token: std::env::var("VAULT_TOKEN").ok(),
            vault_mount: std::env::var("VAULT_MOUNT").ok(),
            azure_vault_url: std::env::var("AZURE_VAULT_URL").ok(),
            azure_access_token: std::env::var("AZURE_ACCESS_TOKEN").ok(),
        }
    }
}

type BackendFactory =
    Box<dyn Fn(&SecretsConfig) -> Result<Arc<dyn SecretsBackend>> + Send + Sync>;

/// Registry mapping backend names to constructors.
pub struct SecretsRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl SecretsRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with all built-in backends registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("encrypted-db", |config| {
            let dir = config
                .data_dir
                .clone()
                .ok_or_else(|| SecretsError::Config("DATA_DIR is required".into()))?;
            let key = encrypted::derive_key(config.encryption_key.as_deref())?;
            Ok(Arc::new(encrypted::EncryptedDbBackend::open(dir, key)?))
        });
        registry.register("vault", |config| {
            let addr = config
                .vault_addr
                .clone()
                .ok_or_else(|| SecretsError::Config("VAULT_ADDR is required".into()))?;
            let token = config
                .vault_token
                .clone()
                .ok_or_else(|| SecretsError::Config("VAULT_TOKEN is required".into()))?;
            let mount = config.vault_mount.clone().unwrap_or_else(|| "secret".into());
            Ok(Arc::new(vault::VaultBackend::new(addr, token, mount)?))
        });
        registry.register("azure-keyvault", |config| {
            let url = config
                .azure_vault_url
                .clone()
                .ok_or_else(|| SecretsError::Config("AZURE_VAULT_URL is required".into()))?;
            let token = config
                .azure_access_token
                .clone()
                .ok_or_else(|| SecretsError::Config("AZURE_ACCESS_TOKEN is required".into()))?;
            Ok(Arc::new(azure::AzureKeyVaultBackend::new(url, token)?))
        });
        registry
    }

    /// Register a backend constructor under a name.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&SecretsConfig) -> Result<Arc<dyn SecretsBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Construct the backend named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::UnknownBackend`] for unregistered names, or
    /// the backend's own construction error.
    pub fn create(&self, config: &SecretsConfig) -> Result<Arc<dyn SecretsBackend>> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| SecretsError::UnknownBackend(config.backend.clone()))?;
        factory(config)
    }

    /// Names of all registered backends, for diagnostics.
    #[must_use]
    pub fn backend_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for SecretsRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtins() {
        let registry = SecretsRegistry::with_defaults();
        let mut names = registry.backend_names();
        names.sort_unstable();
        assert_eq!(names, vec!["azure-keyvault", "encrypted-db", "vault"]);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let registry = SecretsRegistry::with_defaults();
        let config = SecretsConfig {
            backend: "etcd".into(),
            ..SecretsConfig::default()
        };
        assert!(matches!(
            registry.create(&config),
            Err(SecretsError::UnknownBackend(_))
        ));
    }

    #[test]
    fn encrypted_backend_requires_data_dir() {
        let registry = SecretsRegistry::with_defaults();
        let config = SecretsConfig {
            backend: "encrypted-db".into(),
            encryption_key: Some("key".into()),
            ..SecretsConfig::default()
        };
        assert!(matches!(
            registry.create(&config),
            Err(SecretsError::Config(_))
        ));
    }
}
