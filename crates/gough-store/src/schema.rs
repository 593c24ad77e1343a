//! Database schema definitions and column families.

/// Column family names.
pub mod cf {
    /// User records, keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Index: lowercased email → `user_id`.
    pub const USERS_BY_EMAIL: &str = "users_by_email";

    /// Team records, keyed by `team_id`.
    pub const TEAMS: &str = "teams";

    /// Membership records, keyed by `team_id || user_id`.
    pub const MEMBERSHIPS: &str = "memberships";

    /// Index: memberships by user, keyed by `user_id || team_id`.
    pub const MEMBERSHIPS_BY_USER: &str = "memberships_by_user";

    /// Resource assignments, keyed by `team_id || resource_type || 0x00 || resource_id`.
    pub const ASSIGNMENTS: &str = "assignments";

    /// Cloud provider records, keyed by `provider_id`.
    pub const PROVIDERS: &str = "providers";

    /// Machine cache rows, keyed by `provider_id || external_id`.
    pub const MACHINES: &str = "machines";

    /// Access agent records, keyed by `agent_id`.
    pub const AGENTS: &str = "agents";

    /// Index: agents by status, keyed by `status || agent_id`.
    pub const AGENTS_BY_STATUS: &str = "agents_by_status";

    /// Enrollment keys, keyed by the SHA-256 of the plaintext key.
    pub const ENROLLMENT_KEYS: &str = "enrollment_keys";

    /// SSH CA configuration rows, keyed by CA name.
    pub const CA_CONFIGS: &str = "ca_configs";

    /// Shell session records, keyed by `session_id`.
    pub const SESSIONS: &str = "sessions";

    /// Index: sessions by agent, keyed by `agent_id || session_id`.
    pub const SESSIONS_BY_AGENT: &str = "sessions_by_agent";

    /// Refresh token records, keyed by jti.
    pub const REFRESH_TOKENS: &str = "refresh_tokens";

    /// Append-only audit log, keyed by `timestamp_nanos || random`.
    pub const AUDIT: &str = "audit";

    /// Webhook event dedup log, keyed by the event's dedup tuple.
    pub const WEBHOOK_EVENTS: &str = "webhook_events";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::USERS,
        cf::USERS_BY_EMAIL,
        cf::TEAMS,
        cf::MEMBERSHIPS,
        cf::MEMBERSHIPS_BY_USER,
        cf::ASSIGNMENTS,
        cf::PROVIDERS,
        cf::MACHINES,
        cf::AGENTS,
        cf::AGENTS_BY_STATUS,
        cf::ENROLLMENT_KEYS,
        cf::CA_CONFIGS,
        cf::SESSIONS,
        cf::SESSIONS_BY_AGENT,
        cf::REFRESH_TOKENS,
        cf::AUDIT,
        cf::WEBHOOK_EVENTS,
    ]
}
