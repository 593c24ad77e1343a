//! Request and response types for control plane operations.

use chrono::{DateTime, Utc};
use gough_core::{AgentId, SessionId};
use gough_store::SessionType;
use serde::{Deserialize, Serialize};

/// Body of an agent enrollment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Agent hostname.
    pub hostname: String,
    /// Agent public IP address.
    pub ip_address: String,
    /// Agent software version.
    pub agent_version: String,
    /// Capabilities the agent offers (e.g. `ssh`).
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Port of the agent's reverse-SSH server.
    #[serde(default = "default_rssh_port")]
    pub rssh_port: u16,
}

const fn default_rssh_port() -> u16 {
    2222
}

/// Response to a successful enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    /// The agent's stable identifier.
    pub agent_id: AgentId,
    /// Short-lived access token.
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// CA public key the agent caches for certificate validation.
    pub ca_public_key: String,
    /// Operating configuration for the agent.
    pub config: AgentConfigPayload,
}

/// Configuration handed to agents at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigPayload {
    /// Seconds between heartbeats.
    pub heartbeat_interval_s: u64,
}

/// Resource usage reported in a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU utilization percentage.
    #[serde(default)]
    pub cpu_percent: f32,
    /// Memory utilization percentage.
    #[serde(default)]
    pub mem_percent: f32,
    /// Available memory in MB.
    #[serde(default)]
    pub mem_available_mb: u64,
    /// Open connection count.
    #[serde(default)]
    pub connections: u32,
}

/// Body of an agent heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// The reporting agent.
    pub agent_id: AgentId,
    /// Agent-reported status string.
    pub status: String,
    /// Live PTY session count.
    pub active_sessions: u32,
    /// Sessions that ended since the previous heartbeat.
    #[serde(default)]
    pub closed_sessions: Vec<SessionId>,
    /// Host resource usage.
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Agent clock at send time; the server drops out-of-order reports.
    pub timestamp: DateTime<Utc>,
}

/// Response to a heartbeat: the drained command queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Commands for the agent to execute, in order.
    pub commands: Vec<AgentCommand>,
}

/// A queued command for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Re-read the local configuration file.
    ReloadConfig,
    /// Close one PTY session.
    TerminateSession {
        /// The session to close.
        session_id: SessionId,
    },
    /// Stop gracefully.
    Shutdown,
}

/// Body of a shell session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenShellRequest {
    /// Target resource type (e.g. `vm`).
    pub resource_type: String,
    /// Target resource identifier.
    pub resource_id: String,
    /// Kind of session to establish.
    #[serde(default = "default_session_type")]
    pub session_type: SessionType,
    /// The user's SSH public key to certify.
    pub public_key: String,
}

const fn default_session_type() -> SessionType {
    SessionType::Ssh
}

/// Response to a successful shell session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenShellResponse {
    /// The brokered session.
    pub session_id: SessionId,
    /// Host the SSH client should connect to.
    pub agent_host: String,
    /// Port of the agent's reverse-SSH server.
    pub agent_port: u16,
    /// The signed OpenSSH certificate.
    pub certificate: String,
    /// Principals embedded in the certificate.
    pub principals: Vec<String>,
    /// Certificate expiry; also the session's wall-clock ceiling.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_command_wire_format() {
        let session_id = SessionId::generate();
        let command = AgentCommand::TerminateSession { session_id };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "terminate_session");
        assert_eq!(json["session_id"], session_id.to_string());

        let reload: AgentCommand =
            serde_json::from_value(serde_json::json!({"type": "reload_config"})).unwrap();
        assert_eq!(reload, AgentCommand::ReloadConfig);
    }

    #[test]
    fn enroll_request_defaults_port() {
        let request: EnrollRequest = serde_json::from_value(serde_json::json!({
            "hostname": "agent-1",
            "ip_address": "10.0.0.5",
            "agent_version": "1.0.0",
            "capabilities": ["ssh"],
        }))
        .unwrap();
        assert_eq!(request.rssh_port, 2222);
    }
}
