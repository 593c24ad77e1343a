//! Embedded persistent store for the gough control plane.
//!
//! This crate persists everything the control plane owns: users, teams,
//! memberships, resource assignments, cloud providers, the machine cache,
//! access agents, enrollment keys, CA configuration, shell sessions, refresh
//! tokens, the audit log, and the webhook dedup log.
//!
//! The store is an embedded column-family database. Every lookup the API
//! needs is backed by either a natural-key read or a prefix scan over a
//! secondary-index column family (see [`keys`] for the encodings).
//! Uniqueness invariants (case-insensitive emails, one row per machine
//! natural key, one active user CA) are enforced at this API, not above it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AccessAgent, AgentStatus, AuditEvent, CaKind, CloudProvider, EnrollmentKey, MachineRecord,
    ProviderKind, RefreshToken, ResourceAssignment, Role, SessionType, ShellSession, SshCaConfig,
    Team, TeamMembership, TeamRole, User, WebhookEvent,
};

use gough_core::{AgentId, ProviderId, SessionId, TeamId, UserId};

/// The storage contract used by the control plane.
///
/// Implementations must be safe for concurrent use; the control plane calls
/// into the store from many request handlers and background workers at once.
pub trait Store: Send + Sync {
    // =========================================================================
    // Users
    // =========================================================================

    /// Insert or update a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the email is already registered
    /// to a different user.
    fn put_user(&self, user: &User) -> Result<()>;

    /// Get a user by id.
    fn get_user(&self, id: &UserId) -> Result<Option<User>>;

    /// Get a user by email (case-insensitive).
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// List all users.
    fn list_users(&self) -> Result<Vec<User>>;

    // =========================================================================
    // Teams and memberships
    // =========================================================================

    /// Insert or update a team.
    fn put_team(&self, team: &Team) -> Result<()>;

    /// Get a team by id.
    fn get_team(&self, id: &TeamId) -> Result<Option<Team>>;

    /// List all teams.
    fn list_teams(&self) -> Result<Vec<Team>>;

    /// Insert or update a membership.
    fn put_membership(&self, membership: &TeamMembership) -> Result<()>;

    /// Remove a membership.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the membership does not exist.
    fn delete_membership(&self, team_id: &TeamId, user_id: &UserId) -> Result<()>;

    /// Get one membership.
    fn get_membership(&self, team_id: &TeamId, user_id: &UserId)
        -> Result<Option<TeamMembership>>;

    /// List a team's memberships.
    fn list_memberships_by_team(&self, team_id: &TeamId) -> Result<Vec<TeamMembership>>;

    /// List a user's memberships across all teams.
    fn list_memberships_by_user(&self, user_id: &UserId) -> Result<Vec<TeamMembership>>;

    // =========================================================================
    // Resource assignments
    // =========================================================================

    /// Insert or update an assignment.
    fn put_assignment(&self, assignment: &ResourceAssignment) -> Result<()>;

    /// Remove an assignment.
    fn delete_assignment(
        &self,
        team_id: &TeamId,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<()>;

    /// Get the assignment for one `(team, resource)` pair.
    fn get_assignment(
        &self,
        team_id: &TeamId,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceAssignment>>;

    /// List all assignments granted to a team.
    fn list_assignments_by_team(&self, team_id: &TeamId) -> Result<Vec<ResourceAssignment>>;

    // =========================================================================
    // Cloud providers and the machine cache
    // =========================================================================

    /// Insert or update a provider.
    fn put_provider(&self, provider: &CloudProvider) -> Result<()>;

    /// Get a provider by id.
    fn get_provider(&self, id: &ProviderId) -> Result<Option<CloudProvider>>;

    /// List all providers.
    fn list_providers(&self) -> Result<Vec<CloudProvider>>;

    /// Insert or update a machine cache row.
    fn put_machine(&self, machine: &MachineRecord) -> Result<()>;

    /// Get a machine cache row by natural key.
    fn get_machine(
        &self,
        provider_id: &ProviderId,
        external_id: &str,
    ) -> Result<Option<MachineRecord>>;

    /// List all cached machines for a provider.
    fn list_machines_by_provider(&self, provider_id: &ProviderId) -> Result<Vec<MachineRecord>>;

    // =========================================================================
    // Agents and enrollment
    // =========================================================================

    /// Insert or update an agent, maintaining the status index.
    fn put_agent(&self, agent: &AccessAgent) -> Result<()>;

    /// Get an agent by id.
    fn get_agent(&self, id: &AgentId) -> Result<Option<AccessAgent>>;

    /// List all agents.
    fn list_agents(&self) -> Result<Vec<AccessAgent>>;

    /// List agents with a given status.
    fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<AccessAgent>>;

    /// Insert an enrollment key record.
    fn put_enrollment_key(&self, key: &EnrollmentKey) -> Result<()>;

    /// Look up an enrollment key by its hash.
    fn get_enrollment_key(&self, key_hash: &str) -> Result<Option<EnrollmentKey>>;

    // =========================================================================
    // SSH CA
    // =========================================================================

    /// Insert or update a CA row.
    ///
    /// Writing an active `user` CA deactivates any other active `user` CA in
    /// the same batch, so exactly one is active at all times.
    fn put_ca_config(&self, ca: &SshCaConfig) -> Result<()>;

    /// Get a CA row by name.
    fn get_ca_config(&self, name: &str) -> Result<Option<SshCaConfig>>;

    /// List all CA rows.
    fn list_ca_configs(&self) -> Result<Vec<SshCaConfig>>;

    /// The currently active user CA, if any.
    fn active_user_ca(&self) -> Result<Option<SshCaConfig>>;

    /// Atomically increment and durably persist the CA's serial counter,
    /// returning the new value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the CA does not exist.
    fn next_ca_serial(&self, name: &str) -> Result<u64>;

    // =========================================================================
    // Shell sessions
    // =========================================================================

    /// Insert or update a session, maintaining the agent index.
    fn put_session(&self, session: &ShellSession) -> Result<()>;

    /// Get a session by id.
    fn get_session(&self, id: &SessionId) -> Result<Option<ShellSession>>;

    /// List all sessions brokered onto one agent.
    fn list_sessions_by_agent(&self, agent_id: &AgentId) -> Result<Vec<ShellSession>>;

    /// List sessions that have not ended yet.
    fn list_active_sessions(&self) -> Result<Vec<ShellSession>>;

    // =========================================================================
    // Refresh tokens
    // =========================================================================

    /// Insert or update a refresh token record.
    fn put_refresh_token(&self, token: &RefreshToken) -> Result<()>;

    /// Get a refresh token record by jti.
    fn get_refresh_token(&self, jti: &uuid::Uuid) -> Result<Option<RefreshToken>>;

    // =========================================================================
    // Audit and webhooks
    // =========================================================================

    /// Append an audit event.
    fn append_audit(&self, event: &AuditEvent) -> Result<()>;

    /// The most recent audit events, newest first.
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>>;

    /// Record a webhook event for dedup.
    ///
    /// Returns `true` when the event is new, `false` when an identical
    /// `(source, event_type, resource_id, received_at)` tuple was already
    /// recorded.
    fn record_webhook_event(&self, event: &WebhookEvent) -> Result<bool>;
}
