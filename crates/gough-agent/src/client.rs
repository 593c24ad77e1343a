//! Management server client.
//!
//! Enrollment, token rotation, and the heartbeat channel. The heartbeat
//! timeout is shorter than the interval so a slow server cannot back up
//! the loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gough_core::{AgentId, SessionId};

use crate::config::AgentConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from management server calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// 401: bad or expired credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 403: the agent is suspended.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// 409: the enrollment key was already used.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success response.
    #[error("server returned {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Network failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Body of the enrollment request.
#[derive(Debug, Serialize)]
pub struct EnrollBody {
    /// Agent hostname.
    pub hostname: String,
    /// Agent public IP.
    pub ip_address: String,
    /// Agent version.
    pub agent_version: String,
    /// Offered capabilities.
    pub capabilities: Vec<String>,
    /// Reverse-SSH port.
    pub rssh_port: u16,
}

/// Enrollment response.
#[derive(Debug, Deserialize)]
pub struct EnrollReply {
    /// Assigned agent id.
    pub agent_id: AgentId,
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// CA public key to cache for certificate validation.
    pub ca_public_key: String,
    /// Server-directed configuration.
    pub config: EnrollConfig,
}

/// Configuration section of the enrollment response.
#[derive(Debug, Deserialize)]
pub struct EnrollConfig {
    /// Seconds between heartbeats.
    pub heartbeat_interval_s: u64,
}

/// Token rotation response.
#[derive(Debug, Deserialize)]
pub struct RefreshReply {
    /// New access token.
    pub access_token: String,
    /// New refresh token.
    pub refresh_token: String,
}

/// Host resource usage reported in heartbeats.
#[derive(Debug, Default, Serialize)]
pub struct ResourceUsage {
    /// CPU utilization percentage.
    pub cpu_percent: f32,
    /// Memory utilization percentage.
    pub mem_percent: f32,
    /// Available memory in MB.
    pub mem_available_mb: u64,
    /// Open connection count.
    pub connections: u32,
}

/// Heartbeat body.
#[derive(Debug, Serialize)]
pub struct HeartbeatBody {
    /// This agent.
    pub agent_id: AgentId,
    /// Agent-reported status.
    pub status: String,
    /// Live PTY session count.
    pub active_sessions: u32,
    /// Sessions that ended since the previous heartbeat.
    pub closed_sessions: Vec<SessionId>,
    /// Host resource usage.
    pub resource_usage: ResourceUsage,
    /// Send time.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A command from the heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    /// Re-read the local configuration.
    ReloadConfig,
    /// Close one PTY session.
    TerminateSession {
        /// The session to close.
        session_id: SessionId,
    },
    /// Stop gracefully.
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct HeartbeatReply {
    #[serde(default)]
    commands: Vec<ServerCommand>,
}

/// HTTP client for the management server.
pub struct ManagementClient {
    client: reqwest::Client,
    base_url: String,
}

impl ManagementClient {
    /// Build a client from the agent configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if !config.verify_ssl {
            tracing::warn!("TLS verification disabled (GOUGH_VERIFY_SSL=false)");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.management_server.clone(),
        })
    }

    /// Redeem an enrollment key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] for invalid keys and
    /// [`ClientError::Conflict`] for used ones.
    pub async fn enroll(&self, key: &str, body: &EnrollBody) -> Result<EnrollReply, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/v1/agents/enroll", self.base_url))
            .header("X-Enrollment-Key", key)
            .json(body)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Rotate the token pair.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] for rotated-out tokens; the
    /// agent surfaces this to the operator since its identity is gone.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshReply, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/v1/agents/refresh", self.base_url))
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Send one heartbeat and receive queued commands.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Forbidden`] when suspended and
    /// [`ClientError::Unauthorized`] when the access token expired.
    pub async fn heartbeat(
        &self,
        access_token: &str,
        body: &HeartbeatBody,
    ) -> Result<Vec<ServerCommand>, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/v1/agents/heartbeat", self.base_url))
            .timeout(HEARTBEAT_TIMEOUT)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?;
        let reply: HeartbeatReply = Self::parse(response).await?;
        Ok(reply.commands)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 => ClientError::Unauthorized(body),
            403 => ClientError::Forbidden(body),
            409 => ClientError::Conflict(body),
            code => ClientError::Http { status: code, body },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AgentConfig {
        AgentConfig {
            management_server: server.uri(),
            enrollment_key: Some("a1b2".to_string()),
            rssh_port: 2222,
            heartbeat_interval_s: 30,
            verify_ssl: true,
            state_dir: std::path::PathBuf::from("/tmp"),
            allow_root_fallback: false,
        }
    }

    fn enroll_body() -> EnrollBody {
        EnrollBody {
            hostname: "agent-1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            agent_version: "1.0.0".to_string(),
            capabilities: vec!["ssh".to_string()],
            rssh_port: 2222,
        }
    }

    #[tokio::test]
    async fn enroll_sends_key_header() {
        let server = MockServer::start().await;
        let agent_id = AgentId::generate();
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/enroll"))
            .and(header("X-Enrollment-Key", "a1b2"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "agent_id": agent_id,
                "access_token": "at",
                "refresh_token": "rt",
                "ca_public_key": "ssh-rsa AAAA",
                "config": { "heartbeat_interval_s": 30 },
            })))
            .mount(&server)
            .await;

        let client = ManagementClient::new(&config(&server)).unwrap();
        let reply = client.enroll("a1b2", &enroll_body()).await.unwrap();
        assert_eq!(reply.agent_id, agent_id);
        assert!(reply.ca_public_key.starts_with("ssh-rsa "));
        assert_eq!(reply.config.heartbeat_interval_s, 30);
    }

    #[tokio::test]
    async fn used_key_is_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/enroll"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already used"))
            .mount(&server)
            .await;

        let client = ManagementClient::new(&config(&server)).unwrap();
        let result = client.enroll("a1b2", &enroll_body()).await;
        assert!(matches!(result, Err(ClientError::Conflict(_))));
    }

    #[tokio::test]
    async fn heartbeat_parses_commands() {
        let server = MockServer::start().await;
        let session_id = SessionId::generate();
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/heartbeat"))
            .and(header("Authorization", "Bearer at"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "commands": [
                    { "type": "terminate_session", "session_id": session_id },
                    { "type": "reload_config" },
                ],
            })))
            .mount(&server)
            .await;

        let client = ManagementClient::new(&config(&server)).unwrap();
        let body = HeartbeatBody {
            agent_id: AgentId::generate(),
            status: "healthy".to_string(),
            active_sessions: 0,
            closed_sessions: vec![],
            resource_usage: ResourceUsage::default(),
            timestamp: chrono::Utc::now(),
        };
        let commands = client.heartbeat("at", &body).await.unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            ServerCommand::TerminateSession { session_id }
        );
    }

    #[tokio::test]
    async fn suspension_is_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agents/heartbeat"))
            .respond_with(ResponseTemplate::new(403).set_body_string("suspended"))
            .mount(&server)
            .await;

        let client = ManagementClient::new(&config(&server)).unwrap();
        let body = HeartbeatBody {
            agent_id: AgentId::generate(),
            status: "healthy".to_string(),
            active_sessions: 0,
            closed_sessions: vec![],
            resource_usage: ResourceUsage::default(),
            timestamp: chrono::Utc::now(),
        };
        let result = client.heartbeat("at", &body).await;
        assert!(matches!(result, Err(ClientError::Forbidden(_))));
    }
}
