//! Domain types persisted in the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use gough_core::{AgentId, MachineState, ProviderId, SessionId, TeamId, UserId};
use serde::{Deserialize, Serialize};

/// A global role from the fixed seed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full control over the installation.
    Admin,
    /// May manage cloud providers and machines.
    Maintainer,
    /// Read-only access.
    Viewer,
}

/// A user account.
///
/// Users are deactivated, never deleted, so the audit trail stays coherent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: UserId,
    /// Email address; unique case-insensitively.
    pub email: String,
    /// bcrypt password hash.
    pub password_hash: String,
    /// False once deactivated.
    pub active: bool,
    /// Opaque handle embedded in issued tokens; regenerating it invalidates
    /// every outstanding token for this user.
    pub unique_token: String,
    /// Global roles held by this user.
    pub global_roles: BTreeSet<Role>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A team of users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    /// Unique identifier.
    pub id: TeamId,
    /// Team name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// The creating user, who is also the initial owner.
    pub created_by: UserId,
    /// False once deactivated.
    pub active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Role of a user within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    /// Full control including membership management; every team keeps at
    /// least one owner.
    Owner,
    /// Full control over the team's resources.
    Admin,
    /// Regular member.
    Member,
    /// Read-only membership.
    Viewer,
}

/// A user's membership in a team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMembership {
    /// The team.
    pub team_id: TeamId,
    /// The member.
    pub user_id: UserId,
    /// The member's role in this team.
    pub role: TeamRole,
    /// When the membership was created.
    pub created_at: DateTime<Utc>,
}

/// A grant of permissions on one resource to one team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAssignment {
    /// The granted team.
    pub team_id: TeamId,
    /// Resource type (e.g. `vm`, `container`, `cluster`).
    pub resource_type: String,
    /// Resource identifier within its type.
    pub resource_id: String,
    /// Granted permission strings; `shell` enables shell access.
    pub permissions: BTreeSet<String>,
    /// Unix account names members may assume in shell sessions.
    /// Empty means the broker's default applies.
    #[serde(default)]
    pub shell_principals: Vec<String>,
    /// When the assignment was created.
    pub created_at: DateTime<Utc>,
}

/// Supported cloud backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Canonical MaaS bare metal.
    Maas,
    /// LXD containers and VMs.
    Lxd,
    /// AWS EC2.
    Aws,
    /// GCP Compute Engine.
    Gcp,
    /// Azure virtual machines.
    Azure,
    /// Vultr cloud compute.
    Vultr,
}

impl ProviderKind {
    /// The lowercase name used in configuration and APIs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Maas => "maas",
            Self::Lxd => "lxd",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Vultr => "vultr",
        }
    }
}

/// A registered cloud provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProvider {
    /// Unique identifier.
    pub id: ProviderId,
    /// Display name.
    pub name: String,
    /// Backend type.
    pub kind: ProviderKind,
    /// Default region, where the backend has one.
    pub region: String,
    /// Secrets Store path holding the provider credentials.
    pub credentials_ref: String,
    /// Optional Secrets Store path holding the webhook HMAC secret.
    #[serde(default)]
    pub webhook_secret_ref: Option<String>,
    /// False once disabled; inactive providers are skipped by the sync loop.
    pub active: bool,
    /// Completion time of the last successful inventory sync.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A cached machine row.
///
/// The provider is authoritative; this row is refreshed by inventory sync
/// and webhooks. Reconciliation never rewrites the natural key or
/// `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    /// The owning provider instance.
    pub provider_id: ProviderId,
    /// The provider's identifier for this machine.
    pub external_id: String,
    /// Hostname or display name.
    pub hostname: String,
    /// Unified lifecycle state.
    pub state: MachineState,
    /// Public IP addresses.
    pub public_ips: Vec<String>,
    /// Private IP addresses.
    pub private_ips: Vec<String>,
    /// Instance size or flavor.
    pub size: String,
    /// OS image.
    pub image: String,
    /// Provider tags or labels.
    pub tags: BTreeMap<String, String>,
    /// Provider-specific extra data.
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// First time the control plane saw this machine.
    pub created_at: DateTime<Utc>,
    /// Last reconciliation write.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of an access agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AgentStatus {
    /// Enrollment key minted, agent not yet seen.
    Pending = 1,
    /// Enrollment completed, no heartbeat yet.
    Enrolled = 2,
    /// Heartbeating normally.
    Active = 3,
    /// Missed three heartbeat intervals.
    Unreachable = 4,
    /// Suspended administratively or after refresh-token reuse.
    Suspended = 5,
}

impl AgentStatus {
    /// Convert the status to its numeric representation for index keys.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value back to an `AgentStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Enrolled),
            3 => Some(Self::Active),
            4 => Some(Self::Unreachable),
            5 => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// An access agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessAgent {
    /// Stable identifier assigned at enrollment.
    pub agent_id: AgentId,
    /// Hostname reported at enrollment.
    pub hostname: String,
    /// Public IP reported at enrollment.
    pub public_ip: String,
    /// TCP port of the agent's reverse-SSH server.
    pub rssh_port: u16,
    /// SHA-256 of the enrollment key the agent redeemed.
    pub enrollment_key_hash: String,
    /// jti of the currently valid refresh token.
    pub refresh_token_id: Option<uuid::Uuid>,
    /// Timestamp of the newest accepted heartbeat.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Capabilities reported at enrollment (e.g. `ssh`).
    pub capabilities: Vec<String>,
    /// Agent software version.
    pub agent_version: String,
    /// Sessions reported in the newest heartbeat.
    pub active_sessions: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A single-use agent enrollment key (hash only; plaintext is shown once).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentKey {
    /// Hex SHA-256 of the plaintext key.
    pub key_hash: String,
    /// The admin who minted the key.
    pub created_by: UserId,
    /// When the key was minted.
    pub created_at: DateTime<Utc>,
    /// After this instant the key is unredeemable.
    pub expires_at: DateTime<Utc>,
    /// True once redeemed.
    pub used: bool,
    /// The agent that redeemed the key.
    pub used_by_agent: Option<AgentId>,
}

/// Kind of an SSH CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaKind {
    /// Signs user certificates.
    User,
    /// Signs host certificates.
    Host,
}

/// SSH certificate authority configuration.
///
/// Exactly one `user` CA is active at a time. Rotation marks the previous CA
/// inactive but keeps the row so agents holding both public keys continue to
/// accept unexpired certificates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshCaConfig {
    /// CA name; also the key of this row.
    pub name: String,
    /// CA kind.
    pub kind: CaKind,
    /// CA public key in OpenSSH format.
    pub public_key: String,
    /// Secrets Store path of the private key.
    pub private_key_ref: String,
    /// Default certificate validity in seconds.
    pub default_validity_s: u64,
    /// Hard ceiling on certificate validity in seconds.
    pub max_validity_s: u64,
    /// Principals this CA may embed in certificates.
    pub allowed_principals: Vec<String>,
    /// Monotonic certificate serial counter.
    pub serial: u64,
    /// Whether this CA signs new certificates.
    pub active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Type of shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Interactive SSH shell.
    Ssh,
    /// kubectl exec-style session.
    Kubectl,
    /// docker exec-style session.
    Docker,
    /// Cloud provider CLI session.
    CloudCli,
}

/// A shell session record.
///
/// Mutated exactly twice: at creation and at termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellSession {
    /// Unique identifier.
    pub session_id: SessionId,
    /// The requesting user.
    pub user_id: UserId,
    /// The team whose assignment authorized the session.
    pub team_id: TeamId,
    /// Target resource type.
    pub resource_type: String,
    /// Target resource identifier.
    pub resource_id: String,
    /// The brokered agent.
    pub agent_id: AgentId,
    /// Session type.
    pub session_type: SessionType,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end; `None` while live.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock ceiling: the certificate's expiry.
    pub expires_at: DateTime<Utc>,
    /// Client address that requested the session.
    pub client_ip: String,
    /// Optional reference to a session recording.
    #[serde(default)]
    pub recording_ref: Option<String>,
}

/// An append-only audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Acting identity (`user:<id>`, `agent:<id>`, or `system`).
    pub actor: String,
    /// Action name (e.g. `shell.open`, `machine.create`).
    pub action: String,
    /// Resource type the action targeted.
    pub resource_type: String,
    /// Resource identifier the action targeted.
    pub resource_id: String,
    /// `success` or `failure`.
    pub outcome: String,
    /// Structured details.
    pub details: serde_json::Value,
    /// The request id the action was performed under.
    pub request_id: String,
}

/// A received webhook event, retained for dedup and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event source (e.g. `maas`).
    pub source: String,
    /// Event type as named by the source.
    pub event_type: String,
    /// Affected resource id.
    pub resource_id: String,
    /// Raw payload.
    pub payload: serde_json::Value,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
    /// True once dispatched into reconciliation.
    pub processed: bool,
}

/// A refresh token record for rotation and reuse detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    /// Token id (the JWT `jti` claim).
    pub jti: uuid::Uuid,
    /// Token subject (`user:<id>` or `agent:<id>`).
    pub subject: String,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// True once rotated out; presentation of a revoked token is reuse.
    pub revoked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_u8_roundtrip() {
        for value in 1..=5u8 {
            let status = AgentStatus::from_u8(value).unwrap();
            assert_eq!(status.as_u8(), value);
        }
        assert!(AgentStatus::from_u8(0).is_none());
        assert!(AgentStatus::from_u8(6).is_none());
    }

    #[test]
    fn provider_kind_names() {
        assert_eq!(ProviderKind::Maas.as_str(), "maas");
        assert_eq!(ProviderKind::Vultr.as_str(), "vultr");
        let parsed: ProviderKind = serde_json::from_str("\"aws\"").unwrap();
        assert_eq!(parsed, ProviderKind::Aws);
    }

    #[test]
    fn session_type_serde() {
        let json = serde_json::to_string(&SessionType::CloudCli).unwrap();
        assert_eq!(json, "\"cloud_cli\"");
    }
}
