//! `RocksDB` storage implementation.

use std::path::Path;
use std::sync::Arc;

use gough_core::{AgentId, ProviderId, SessionId, TeamId, UserId};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    AccessAgent, AgentStatus, AuditEvent, CaKind, CloudProvider, EnrollmentKey, MachineRecord,
    RefreshToken, ResourceAssignment, ShellSession, SshCaConfig, Team, TeamMembership, User,
    WebhookEvent,
};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    // Serial increments must be read-modify-write atomic; the lock spans the
    // read and the durable write.
    serial_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            serial_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put_record<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let data = Self::serialize(value)?;
        self.db
            .put_cf(&cf, key, data)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn scan_all<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            records.push(Self::deserialize(&value)?);
        }
        Ok(records)
    }

    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            records.push(Self::deserialize(&value)?);
        }
        Ok(records)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Users
    // =========================================================================

    fn put_user(&self, user: &User) -> Result<()> {
        let cf_users = self.cf(cf::USERS)?;
        let cf_by_email = self.cf(cf::USERS_BY_EMAIL)?;

        let email_key = keys::email_key(&user.email);

        // Enforce case-insensitive email uniqueness.
        if let Some(existing) = self
            .db
            .get_cf(&cf_by_email, &email_key)
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            let owner: UserId = Self::deserialize(&existing)?;
            if owner != user.id {
                return Err(StoreError::Conflict(format!(
                    "email already registered: {}",
                    user.email
                )));
            }
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_users, user.id.as_bytes(), Self::serialize(user)?);
        batch.put_cf(&cf_by_email, &email_key, Self::serialize(&user.id)?);
        self.write_batch(batch)
    }

    fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        self.get_record(cf::USERS, id.as_bytes())
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let cf_by_email = self.cf(cf::USERS_BY_EMAIL)?;
        let Some(data) = self
            .db
            .get_cf(&cf_by_email, keys::email_key(email))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        let id: UserId = Self::deserialize(&data)?;
        self.get_user(&id)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        self.scan_all(cf::USERS)
    }

    // =========================================================================
    // Teams and memberships
    // =========================================================================

    fn put_team(&self, team: &Team) -> Result<()> {
        self.put_record(cf::TEAMS, team.id.as_bytes(), team)
    }

    fn get_team(&self, id: &TeamId) -> Result<Option<Team>> {
        self.get_record(cf::TEAMS, id.as_bytes())
    }

    fn list_teams(&self) -> Result<Vec<Team>> {
        self.scan_all(cf::TEAMS)
    }

    fn put_membership(&self, membership: &TeamMembership) -> Result<()> {
        let cf_memberships = self.cf(cf::MEMBERSHIPS)?;
        let cf_by_user = self.cf(cf::MEMBERSHIPS_BY_USER)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_memberships,
            keys::membership_key(&membership.team_id, &membership.user_id),
            Self::serialize(membership)?,
        );
        batch.put_cf(
            &cf_by_user,
            keys::user_membership_key(&membership.user_id, &membership.team_id),
            [],
        );
        self.write_batch(batch)
    }

    fn delete_membership(&self, team_id: &TeamId, user_id: &UserId) -> Result<()> {
        if self.get_membership(team_id, user_id)?.is_none() {
            return Err(StoreError::NotFound);
        }

        let cf_memberships = self.cf(cf::MEMBERSHIPS)?;
        let cf_by_user = self.cf(cf::MEMBERSHIPS_BY_USER)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_memberships, keys::membership_key(team_id, user_id));
        batch.delete_cf(&cf_by_user, keys::user_membership_key(user_id, team_id));
        self.write_batch(batch)
    }

    fn get_membership(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
    ) -> Result<Option<TeamMembership>> {
        self.get_record(cf::MEMBERSHIPS, &keys::membership_key(team_id, user_id))
    }

    fn list_memberships_by_team(&self, team_id: &TeamId) -> Result<Vec<TeamMembership>> {
        self.scan_prefix(cf::MEMBERSHIPS, team_id.as_bytes())
    }

    fn list_memberships_by_user(&self, user_id: &UserId) -> Result<Vec<TeamMembership>> {
        let cf_by_user = self.cf(cf::MEMBERSHIPS_BY_USER)?;
        let prefix = user_id.as_bytes();

        let mut memberships = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            let team_id = keys::extract_team_id_from_user_membership_key(&key);
            if let Some(membership) = self.get_membership(&team_id, user_id)? {
                memberships.push(membership);
            }
        }
        Ok(memberships)
    }

    // =========================================================================
    // Resource assignments
    // =========================================================================

    fn put_assignment(&self, assignment: &ResourceAssignment) -> Result<()> {
        self.put_record(
            cf::ASSIGNMENTS,
            &keys::assignment_key(
                &assignment.team_id,
                &assignment.resource_type,
                &assignment.resource_id,
            ),
            assignment,
        )
    }

    fn delete_assignment(
        &self,
        team_id: &TeamId,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<()> {
        let cf = self.cf(cf::ASSIGNMENTS)?;
        self.db
            .delete_cf(&cf, keys::assignment_key(team_id, resource_type, resource_id))
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_assignment(
        &self,
        team_id: &TeamId,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceAssignment>> {
        self.get_record(
            cf::ASSIGNMENTS,
            &keys::assignment_key(team_id, resource_type, resource_id),
        )
    }

    fn list_assignments_by_team(&self, team_id: &TeamId) -> Result<Vec<ResourceAssignment>> {
        self.scan_prefix(cf::ASSIGNMENTS, team_id.as_bytes())
    }

    // =========================================================================
    // Cloud providers and the machine cache
    // =========================================================================

    fn put_provider(&self, provider: &CloudProvider) -> Result<()> {
        self.put_record(cf::PROVIDERS, provider.id.as_bytes(), provider)
    }

    fn get_provider(&self, id: &ProviderId) -> Result<Option<CloudProvider>> {
        self.get_record(cf::PROVIDERS, id.as_bytes())
    }

    fn list_providers(&self) -> Result<Vec<CloudProvider>> {
        self.scan_all(cf::PROVIDERS)
    }

    fn put_machine(&self, machine: &MachineRecord) -> Result<()> {
        self.put_record(
            cf::MACHINES,
            &keys::machine_key(&machine.provider_id, &machine.external_id),
            machine,
        )
    }

    fn get_machine(
        &self,
        provider_id: &ProviderId,
        external_id: &str,
    ) -> Result<Option<MachineRecord>> {
        self.get_record(cf::MACHINES, &keys::machine_key(provider_id, external_id))
    }

    fn list_machines_by_provider(&self, provider_id: &ProviderId) -> Result<Vec<MachineRecord>> {
        self.scan_prefix(cf::MACHINES, provider_id.as_bytes())
    }

    // =========================================================================
    // Agents and enrollment
    // =========================================================================

    fn put_agent(&self, agent: &AccessAgent) -> Result<()> {
        let cf_agents = self.cf(cf::AGENTS)?;
        let cf_by_status = self.cf(cf::AGENTS_BY_STATUS)?;

        // Maintain the status index across status changes.
        let old_status = self.get_agent(&agent.agent_id)?.map(|a| a.status);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_agents, agent.agent_id.as_bytes(), Self::serialize(agent)?);

        if let Some(old) = old_status {
            if old != agent.status {
                batch.delete_cf(
                    &cf_by_status,
                    keys::status_agent_key(old.as_u8(), &agent.agent_id),
                );
            }
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_agent_key(agent.status.as_u8(), &agent.agent_id),
            [],
        );

        self.write_batch(batch)
    }

    fn get_agent(&self, id: &AgentId) -> Result<Option<AccessAgent>> {
        self.get_record(cf::AGENTS, id.as_bytes())
    }

    fn list_agents(&self) -> Result<Vec<AccessAgent>> {
        self.scan_all(cf::AGENTS)
    }

    fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<AccessAgent>> {
        let cf_by_status = self.cf(cf::AGENTS_BY_STATUS)?;
        let prefix = [status.as_u8()];

        let mut agents = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_by_status, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let agent_id = keys::extract_agent_id_from_status_key(&key);
            if let Some(agent) = self.get_agent(&agent_id)? {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    fn put_enrollment_key(&self, key: &EnrollmentKey) -> Result<()> {
        self.put_record(cf::ENROLLMENT_KEYS, key.key_hash.as_bytes(), key)
    }

    fn get_enrollment_key(&self, key_hash: &str) -> Result<Option<EnrollmentKey>> {
        self.get_record(cf::ENROLLMENT_KEYS, key_hash.as_bytes())
    }

    // =========================================================================
    // SSH CA
    // =========================================================================

    fn put_ca_config(&self, ca: &SshCaConfig) -> Result<()> {
        let cf_cas = self.cf(cf::CA_CONFIGS)?;
        let mut batch = WriteBatch::default();

        // Activating a user CA retires the previous one in the same batch.
        if ca.active && ca.kind == CaKind::User {
            for mut other in self.list_ca_configs()? {
                if other.name != ca.name && other.kind == CaKind::User && other.active {
                    other.active = false;
                    batch.put_cf(&cf_cas, other.name.as_bytes(), Self::serialize(&other)?);
                }
            }
        }

        batch.put_cf(&cf_cas, ca.name.as_bytes(), Self::serialize(ca)?);
        self.write_batch(batch)
    }

    fn get_ca_config(&self, name: &str) -> Result<Option<SshCaConfig>> {
        self.get_record(cf::CA_CONFIGS, name.as_bytes())
    }

    fn list_ca_configs(&self) -> Result<Vec<SshCaConfig>> {
        self.scan_all(cf::CA_CONFIGS)
    }

    fn active_user_ca(&self) -> Result<Option<SshCaConfig>> {
        Ok(self
            .list_ca_configs()?
            .into_iter()
            .find(|ca| ca.kind == CaKind::User && ca.active))
    }

    fn next_ca_serial(&self, name: &str) -> Result<u64> {
        let _guard = self.serial_lock.lock();

        let mut ca = self.get_ca_config(name)?.ok_or(StoreError::NotFound)?;
        ca.serial += 1;

        // The serial must be durable before any certificate carrying it is
        // returned to a caller.
        let cf = self.cf(cf::CA_CONFIGS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(&cf, name.as_bytes(), Self::serialize(&ca)?, &write_opts)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(ca.serial)
    }

    // =========================================================================
    // Shell sessions
    // =========================================================================

    fn put_session(&self, session: &ShellSession) -> Result<()> {
        let cf_sessions = self.cf(cf::SESSIONS)?;
        let cf_by_agent = self.cf(cf::SESSIONS_BY_AGENT)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_sessions,
            session.session_id.as_bytes(),
            Self::serialize(session)?,
        );
        batch.put_cf(
            &cf_by_agent,
            keys::agent_session_key(&session.agent_id, &session.session_id),
            [],
        );
        self.write_batch(batch)
    }

    fn get_session(&self, id: &SessionId) -> Result<Option<ShellSession>> {
        self.get_record(cf::SESSIONS, id.as_bytes())
    }

    fn list_sessions_by_agent(&self, agent_id: &AgentId) -> Result<Vec<ShellSession>> {
        let cf_by_agent = self.cf(cf::SESSIONS_BY_AGENT)?;
        let prefix = agent_id.as_bytes();

        let mut sessions = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_by_agent, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            let session_id = keys::extract_session_id_from_agent_session_key(&key);
            if let Some(session) = self.get_session(&session_id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn list_active_sessions(&self) -> Result<Vec<ShellSession>> {
        Ok(self
            .scan_all::<ShellSession>(cf::SESSIONS)?
            .into_iter()
            .filter(|s| s.ended_at.is_none())
            .collect())
    }

    // =========================================================================
    // Refresh tokens
    // =========================================================================

    fn put_refresh_token(&self, token: &RefreshToken) -> Result<()> {
        self.put_record(cf::REFRESH_TOKENS, token.jti.as_bytes(), token)
    }

    fn get_refresh_token(&self, jti: &uuid::Uuid) -> Result<Option<RefreshToken>> {
        self.get_record(cf::REFRESH_TOKENS, jti.as_bytes())
    }

    // =========================================================================
    // Audit and webhooks
    // =========================================================================

    fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        let nanos = event.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let random = *uuid::Uuid::new_v4().as_bytes();
        self.put_record(cf::AUDIT, &keys::audit_key(nanos, &random), event)
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let cf = self.cf(cf::AUDIT)?;
        let mut events = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(&cf, IteratorMode::End) {
            if events.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            events.push(Self::deserialize(&value)?);
        }
        Ok(events)
    }

    fn record_webhook_event(&self, event: &WebhookEvent) -> Result<bool> {
        let cf = self.cf(cf::WEBHOOK_EVENTS)?;
        let key = keys::webhook_key(
            &event.source,
            &event.event_type,
            &event.resource_id,
            event.received_at.timestamp_nanos_opt().unwrap_or_default(),
        );

        let exists = self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if exists {
            return Ok(false);
        }

        self.db
            .put_cf(&cf, &key, Self::serialize(event)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProviderKind, SessionType, TeamRole};
    use chrono::Utc;
    use gough_core::MachineState;
    use std::collections::{BTreeMap, BTreeSet};

    fn open_store() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn test_user(email: &str) -> User {
        User {
            id: UserId::generate(),
            email: email.to_string(),
            password_hash: "$2b$12$hash".to_string(),
            active: true,
            unique_token: "tok".to_string(),
            global_roles: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    fn test_agent(status: AgentStatus) -> AccessAgent {
        AccessAgent {
            agent_id: AgentId::generate(),
            hostname: "agent-1".to_string(),
            public_ip: "10.0.0.5".to_string(),
            rssh_port: 2222,
            enrollment_key_hash: "hash".to_string(),
            refresh_token_id: None,
            last_heartbeat_at: None,
            status,
            capabilities: vec!["ssh".to_string()],
            agent_version: "1.0.0".to_string(),
            active_sessions: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn user_roundtrip_and_email_lookup() {
        let (_dir, store) = open_store();
        let user = test_user("Alice@Example.com");
        store.put_user(&user).unwrap();

        let by_id = store.get_user(&user.id).unwrap().unwrap();
        assert_eq!(by_id.email, user.email);

        let by_email = store.get_user_by_email("alice@example.COM").unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
    }

    #[test]
    fn duplicate_email_is_conflict() {
        let (_dir, store) = open_store();
        store.put_user(&test_user("a@example.com")).unwrap();

        let result = store.put_user(&test_user("A@EXAMPLE.COM"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn updating_a_user_is_not_a_conflict() {
        let (_dir, store) = open_store();
        let mut user = test_user("a@example.com");
        store.put_user(&user).unwrap();

        user.active = false;
        store.put_user(&user).unwrap();
        assert!(!store.get_user(&user.id).unwrap().unwrap().active);
    }

    #[test]
    fn membership_indexes_both_directions() {
        let (_dir, store) = open_store();
        let team_id = TeamId::generate();
        let user_id = UserId::generate();

        store
            .put_membership(&TeamMembership {
                team_id,
                user_id,
                role: TeamRole::Owner,
                created_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.list_memberships_by_team(&team_id).unwrap().len(), 1);
        assert_eq!(store.list_memberships_by_user(&user_id).unwrap().len(), 1);

        store.delete_membership(&team_id, &user_id).unwrap();
        assert!(store.list_memberships_by_user(&user_id).unwrap().is_empty());
        assert!(matches!(
            store.delete_membership(&team_id, &user_id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn machine_natural_key_is_single_row() {
        let (_dir, store) = open_store();
        let provider_id = ProviderId::generate();

        let mut machine = MachineRecord {
            provider_id,
            external_id: "i-0123".to_string(),
            hostname: "web-1".to_string(),
            state: MachineState::Running,
            public_ips: vec!["203.0.113.7".to_string()],
            private_ips: vec![],
            size: "t3.medium".to_string(),
            image: "ami-1".to_string(),
            tags: BTreeMap::new(),
            extra: serde_json::Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_machine(&machine).unwrap();

        machine.state = MachineState::Stopped;
        store.put_machine(&machine).unwrap();

        let machines = store.list_machines_by_provider(&provider_id).unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].state, MachineState::Stopped);
    }

    #[test]
    fn agent_status_index_tracks_transitions() {
        let (_dir, store) = open_store();
        let mut agent = test_agent(AgentStatus::Enrolled);
        store.put_agent(&agent).unwrap();

        assert_eq!(
            store
                .list_agents_by_status(AgentStatus::Enrolled)
                .unwrap()
                .len(),
            1
        );

        agent.status = AgentStatus::Active;
        store.put_agent(&agent).unwrap();

        assert!(store
            .list_agents_by_status(AgentStatus::Enrolled)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_agents_by_status(AgentStatus::Active)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn ca_serial_is_monotonic() {
        let (_dir, store) = open_store();
        store
            .put_ca_config(&SshCaConfig {
                name: "default".to_string(),
                kind: CaKind::User,
                public_key: "ssh-rsa AAAA".to_string(),
                private_key_ref: "ssh-ca/default/private_key".to_string(),
                default_validity_s: 3600,
                max_validity_s: 28800,
                allowed_principals: vec!["ubuntu".to_string()],
                serial: 0,
                active: true,
                created_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(store.next_ca_serial("default").unwrap(), 1);
        assert_eq!(store.next_ca_serial("default").unwrap(), 2);
        assert_eq!(store.next_ca_serial("default").unwrap(), 3);
        assert!(matches!(
            store.next_ca_serial("missing"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn activating_a_user_ca_retires_the_previous() {
        let (_dir, store) = open_store();
        let make_ca = |name: &str, active: bool| SshCaConfig {
            name: name.to_string(),
            kind: CaKind::User,
            public_key: "ssh-rsa AAAA".to_string(),
            private_key_ref: format!("ssh-ca/{name}/private_key"),
            default_validity_s: 3600,
            max_validity_s: 28800,
            allowed_principals: vec![],
            serial: 0,
            active,
            created_at: Utc::now(),
        };

        store.put_ca_config(&make_ca("ca-1", true)).unwrap();
        store.put_ca_config(&make_ca("ca-2", true)).unwrap();

        let active = store.active_user_ca().unwrap().unwrap();
        assert_eq!(active.name, "ca-2");
        // The old CA is retained for verification overlap, just inactive.
        assert!(!store.get_ca_config("ca-1").unwrap().unwrap().active);
    }

    #[test]
    fn active_sessions_excludes_ended() {
        let (_dir, store) = open_store();
        let agent_id = AgentId::generate();

        let make_session = |ended: bool| ShellSession {
            session_id: SessionId::generate(),
            user_id: UserId::generate(),
            team_id: TeamId::generate(),
            resource_type: "vm".to_string(),
            resource_id: "vm-42".to_string(),
            agent_id,
            session_type: SessionType::Ssh,
            started_at: Utc::now(),
            ended_at: ended.then(Utc::now),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            client_ip: "198.51.100.4".to_string(),
            recording_ref: None,
        };

        store.put_session(&make_session(false)).unwrap();
        store.put_session(&make_session(true)).unwrap();

        assert_eq!(store.list_active_sessions().unwrap().len(), 1);
        assert_eq!(store.list_sessions_by_agent(&agent_id).unwrap().len(), 2);
    }

    #[test]
    fn webhook_dedup() {
        let (_dir, store) = open_store();
        let event = WebhookEvent {
            source: "maas".to_string(),
            event_type: "machine.deployed".to_string(),
            resource_id: "s-01".to_string(),
            payload: serde_json::json!({"system_id": "s-01"}),
            received_at: Utc::now(),
            processed: false,
        };

        assert!(store.record_webhook_event(&event).unwrap());
        assert!(!store.record_webhook_event(&event).unwrap());
    }

    #[test]
    fn provider_roundtrip() {
        let (_dir, store) = open_store();
        let provider = CloudProvider {
            id: ProviderId::generate(),
            name: "prod-aws".to_string(),
            kind: ProviderKind::Aws,
            region: "us-east-1".to_string(),
            credentials_ref: "cloud/aws/prod".to_string(),
            webhook_secret_ref: None,
            active: true,
            last_sync_at: None,
            created_at: Utc::now(),
        };
        store.put_provider(&provider).unwrap();

        let loaded = store.get_provider(&provider.id).unwrap().unwrap();
        assert_eq!(loaded.name, "prod-aws");
        assert_eq!(loaded.kind, ProviderKind::Aws);
    }

    #[test]
    fn refresh_token_roundtrip() {
        let (_dir, store) = open_store();
        let token = RefreshToken {
            jti: uuid::Uuid::new_v4(),
            subject: "agent:xyz".to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            revoked: false,
        };
        store.put_refresh_token(&token).unwrap();

        let loaded = store.get_refresh_token(&token.jti).unwrap().unwrap();
        assert!(!loaded.revoked);
    }

    #[test]
    fn audit_is_ordered_newest_first() {
        let (_dir, store) = open_store();
        for i in 0..3 {
            store
                .append_audit(&AuditEvent {
                    timestamp: Utc::now() + chrono::Duration::milliseconds(i),
                    actor: "system".to_string(),
                    action: format!("action-{i}"),
                    resource_type: "vm".to_string(),
                    resource_id: "vm-1".to_string(),
                    outcome: "success".to_string(),
                    details: serde_json::Value::Null,
                    request_id: "req".to_string(),
                })
                .unwrap();
        }

        let events = store.recent_audit(2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "action-2");
    }
}
