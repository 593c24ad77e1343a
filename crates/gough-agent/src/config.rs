//! Agent configuration from environment variables.

use std::path::PathBuf;

/// Agent configuration.
///
/// All knobs come from `GOUGH_*` environment variables; the state
/// directory holds the host key, cached CA public key, and token file.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the management server.
    pub management_server: String,
    /// One-time enrollment key; only needed until first enrollment.
    pub enrollment_key: Option<String>,
    /// TCP port of the reverse-SSH server.
    pub rssh_port: u16,
    /// Seconds between heartbeats; the server may override at enrollment.
    pub heartbeat_interval_s: u64,
    /// Whether to verify the management server's TLS certificate.
    pub verify_ssl: bool,
    /// State directory for `host_key`, `tokens.json`, and `ca.pub`.
    pub state_dir: PathBuf,
    /// Run sessions as root when the principal has no local account.
    /// Default deny.
    pub allow_root_fallback: bool,
}

impl AgentConfig {
    /// Load the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message naming the missing variable; startup treats this
    /// as fatal (exit code 1).
    pub fn from_env() -> Result<Self, String> {
        let management_server = std::env::var("GOUGH_MANAGEMENT_SERVER")
            .map_err(|_| "GOUGH_MANAGEMENT_SERVER is required".to_string())?;

        let rssh_port = match std::env::var("GOUGH_RSSH_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| format!("invalid GOUGH_RSSH_PORT: {value}"))?,
            Err(_) => 2222,
        };
        let heartbeat_interval_s = match std::env::var("GOUGH_HEARTBEAT_INTERVAL") {
            Ok(value) => value
                .parse()
                .map_err(|_| format!("invalid GOUGH_HEARTBEAT_INTERVAL: {value}"))?,
            Err(_) => 30,
        };

        Ok(Self {
            management_server: management_server.trim_end_matches('/').to_string(),
            enrollment_key: std::env::var("GOUGH_ENROLLMENT_KEY").ok(),
            rssh_port,
            heartbeat_interval_s,
            verify_ssl: std::env::var("GOUGH_VERIFY_SSL")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            state_dir: std::env::var("GOUGH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/gough-agent")),
            allow_root_fallback: std::env::var("GOUGH_ALLOW_ROOT_FALLBACK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }

    /// Path of the persisted reverse-SSH host key.
    #[must_use]
    pub fn host_key_file(&self) -> PathBuf {
        self.state_dir.join("host_key")
    }

    /// Path of the persisted token file.
    #[must_use]
    pub fn token_file(&self) -> PathBuf {
        self.state_dir.join("tokens.json")
    }

    /// Path of the cached CA public key.
    #[must_use]
    pub fn ca_key_file(&self) -> PathBuf {
        self.state_dir.join("ca.pub")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_paths() {
        let config = AgentConfig {
            management_server: "https://gough.example.com".to_string(),
            enrollment_key: None,
            rssh_port: 2222,
            heartbeat_interval_s: 30,
            verify_ssl: true,
            state_dir: PathBuf::from("/var/lib/gough-agent"),
            allow_root_fallback: false,
        };
        assert_eq!(
            config.host_key_file(),
            PathBuf::from("/var/lib/gough-agent/host_key")
        );
        assert_eq!(
            config.token_file(),
            PathBuf::from("/var/lib/gough-agent/tokens.json")
        );
        assert_eq!(
            config.ca_key_file(),
            PathBuf::from("/var/lib/gough-agent/ca.pub")
        );
    }
}
