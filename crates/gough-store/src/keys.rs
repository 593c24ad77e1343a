//! Key encoding utilities.
//!
//! All composite keys are designed to support efficient prefix scans. UUID
//! components are the raw 16 bytes; variable-length string components are
//! separated with a `0x00` byte (none of the encoded strings may contain
//! NUL, which the write paths enforce by construction).

use gough_core::{AgentId, ProviderId, SessionId, TeamId, UserId};

/// Encode a user-email index key (lowercased email bytes).
#[must_use]
pub fn email_key(email: &str) -> Vec<u8> {
    email.to_lowercase().into_bytes()
}

/// Encode a membership key: `team_id || user_id`.
#[must_use]
pub fn membership_key(team_id: &TeamId, user_id: &UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(team_id.as_bytes());
    key.extend_from_slice(user_id.as_bytes());
    key
}

/// Encode a user-membership index key: `user_id || team_id`.
#[must_use]
pub fn user_membership_key(user_id: &UserId, team_id: &TeamId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(team_id.as_bytes());
    key
}

/// Extract the team id from a `user_id || team_id` index key.
///
/// # Panics
///
/// Panics if the key is shorter than 32 bytes.
#[must_use]
pub fn extract_team_id_from_user_membership_key(key: &[u8]) -> TeamId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    TeamId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

/// Encode an assignment key: `team_id || resource_type || 0x00 || resource_id`.
#[must_use]
pub fn assignment_key(team_id: &TeamId, resource_type: &str, resource_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(17 + resource_type.len() + resource_id.len());
    key.extend_from_slice(team_id.as_bytes());
    key.extend_from_slice(resource_type.as_bytes());
    key.push(0);
    key.extend_from_slice(resource_id.as_bytes());
    key
}

/// Encode a machine cache key: `provider_id || external_id`.
#[must_use]
pub fn machine_key(provider_id: &ProviderId, external_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + external_id.len());
    key.extend_from_slice(provider_id.as_bytes());
    key.extend_from_slice(external_id.as_bytes());
    key
}

/// Encode a status-agent index key: `status || agent_id`.
#[must_use]
pub fn status_agent_key(status: u8, agent_id: &AgentId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status);
    key.extend_from_slice(agent_id.as_bytes());
    key
}

/// Extract the agent id from a `status || agent_id` index key.
///
/// # Panics
///
/// Panics if the key is shorter than 17 bytes.
#[must_use]
pub fn extract_agent_id_from_status_key(key: &[u8]) -> AgentId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[1..17]);
    AgentId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

/// Encode an agent-session index key: `agent_id || session_id`.
#[must_use]
pub fn agent_session_key(agent_id: &AgentId, session_id: &SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(agent_id.as_bytes());
    key.extend_from_slice(session_id.as_bytes());
    key
}

/// Extract the session id from an `agent_id || session_id` index key.
///
/// # Panics
///
/// Panics if the key is shorter than 32 bytes.
#[must_use]
pub fn extract_session_id_from_agent_session_key(key: &[u8]) -> SessionId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    SessionId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

/// Encode an audit key: `timestamp_nanos (big-endian) || random`.
///
/// Big-endian ordering keeps the audit log chronologically scannable.
#[must_use]
pub fn audit_key(timestamp_nanos: i64, random: &[u8; 16]) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    #[allow(clippy::cast_sign_loss)]
    key.extend_from_slice(&(timestamp_nanos as u64).to_be_bytes());
    key.extend_from_slice(random);
    key
}

/// Encode a webhook dedup key from the event's identity tuple.
#[must_use]
pub fn webhook_key(
    source: &str,
    event_type: &str,
    resource_id: &str,
    received_at_nanos: i64,
) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(source.len() + event_type.len() + resource_id.len() + 11);
    key.extend_from_slice(source.as_bytes());
    key.push(0);
    key.extend_from_slice(event_type.as_bytes());
    key.push(0);
    key.extend_from_slice(resource_id.as_bytes());
    key.push(0);
    #[allow(clippy::cast_sign_loss)]
    key.extend_from_slice(&(received_at_nanos as u64).to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_key_is_case_insensitive() {
        assert_eq!(email_key("Alice@Example.COM"), email_key("alice@example.com"));
    }

    #[test]
    fn membership_index_roundtrip() {
        let user = UserId::generate();
        let team = TeamId::generate();
        let key = user_membership_key(&user, &team);
        assert_eq!(extract_team_id_from_user_membership_key(&key), team);
    }

    #[test]
    fn session_index_roundtrip() {
        let agent = AgentId::generate();
        let session = SessionId::generate();
        let key = agent_session_key(&agent, &session);
        assert_eq!(extract_session_id_from_agent_session_key(&key), session);
    }

    #[test]
    fn audit_keys_sort_chronologically() {
        let a = audit_key(1, &[0u8; 16]);
        let b = audit_key(2, &[0u8; 16]);
        assert!(a < b);
    }

    #[test]
    fn webhook_key_distinguishes_fields() {
        let a = webhook_key("maas", "machine.deployed", "s-01", 100);
        let b = webhook_key("maas", "machine.deployed", "s-01", 101);
        let c = webhook_key("maas", "machine.released", "s-01", 100);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
