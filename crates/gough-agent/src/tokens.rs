//! Token persistence.
//!
//! The agent keeps its identity (`agent_id`, token pair, cached CA public
//! key) in `tokens.json` under the state directory, mode 0600. Writes go
//! through a temp file and rename so a crash never leaves a torn file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persisted agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTokens {
    /// Agent id assigned at enrollment.
    pub agent_id: gough_core::AgentId,
    /// Current access token.
    pub access_token: String,
    /// Current refresh token.
    pub refresh_token: String,
    /// CA public key in OpenSSH format (may hold several lines after a CA
    /// rotation).
    pub ca_public_key: String,
    /// When this file was last written.
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// Token file handle.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Create a handle for the given file path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Whether a readable, complete token file exists.
    #[must_use]
    pub fn is_enrolled(&self) -> bool {
        self.load().is_ok()
    }

    /// Load the persisted tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or unparseable.
    pub fn load(&self) -> anyhow::Result<PersistedTokens> {
        let data = std::fs::read(&self.path)?;
        let tokens: PersistedTokens = serde_json::from_slice(&data)?;
        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            anyhow::bail!("token file at {} is incomplete", self.path.display());
        }
        Ok(tokens)
    }

    /// Persist the tokens with 0600 permissions.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the write
    /// fails.
    pub fn save(&self, tokens: &PersistedTokens) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(tokens)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;
        set_owner_only(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::info!(path = %self.path.display(), "saved tokens");
        Ok(())
    }
}

/// Restrict a file to owner read/write.
///
/// # Errors
///
/// Returns an error if permissions cannot be changed.
pub fn set_owner_only(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gough_core::AgentId;

    fn tokens() -> PersistedTokens {
        PersistedTokens {
            agent_id: AgentId::generate(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            ca_public_key: "ssh-rsa AAAA".to_string(),
            saved_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));

        assert!(!store.is_enrolled());

        let saved = tokens();
        store.save(&saved).unwrap();
        assert!(store.is_enrolled());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.agent_id, saved.agent_id);
        assert_eq!(loaded.refresh_token, "refresh");
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("tokens.json"));
        store.save(&tokens()).unwrap();

        let mode = std::fs::metadata(dir.path().join("tokens.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn incomplete_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "agent_id": gough_core::AgentId::generate(),
                "access_token": "",
                "refresh_token": "",
                "ca_public_key": "",
                "saved_at": chrono::Utc::now(),
            })
            .to_string(),
        )
        .unwrap();

        let store = TokenStore::new(path);
        assert!(!store.is_enrolled());
    }
}
