//! Shell session brokering.
//!
//! `open_shell` resolves a (user, resource) pair into a target agent and a
//! short-lived certificate: permission check, grant-chain resolution, agent
//! selection, validity clamp, signing, session record, audit. Termination
//! happens on three paths: the agent reports a client disconnect in its
//! heartbeat, an admin queues a terminate command (forced closed after ten
//! seconds either way), or the reaper sweeps sessions past their
//! certificate expiry.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use gough_ca::{generate_key_id, CertificateAuthority};
use gough_core::{AgentId, Capability, SessionId, TeamId, UserId};
use gough_store::{ResourceAssignment, Role, ShellSession, Store, TeamRole};

use crate::audit::Auditor;
use crate::error::{ControlError, Result};
use crate::heartbeat::Heartbeats;
use crate::permissions::PermissionEvaluator;
use crate::types::{AgentCommand, OpenShellRequest, OpenShellResponse};
use crate::ControlConfig;

const DEFAULT_PRINCIPAL: &str = "ubuntu";
const FORCED_CLOSE_AFTER: std::time::Duration = std::time::Duration::from_secs(10);

/// The shell session broker.
pub struct SessionBroker<S: Store> {
    store: Arc<S>,
    ca: Arc<CertificateAuthority<S>>,
    permissions: PermissionEvaluator<S>,
    heartbeats: Arc<Heartbeats<S>>,
    auditor: Auditor<S>,
    config: ControlConfig,
}

impl<S: Store + 'static> SessionBroker<S> {
    /// Create the broker.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        ca: Arc<CertificateAuthority<S>>,
        permissions: PermissionEvaluator<S>,
        heartbeats: Arc<Heartbeats<S>>,
        auditor: Auditor<S>,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            ca,
            permissions,
            heartbeats,
            auditor,
            config,
        }
    }

    /// Open a shell session.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::PermissionDenied`] without the `shell`
    /// capability, [`ControlError::AgentUnavailable`] when no active agent
    /// offers SSH, and validation errors from the CA's signing policy.
    pub async fn open_shell(
        &self,
        user_id: &UserId,
        request: &OpenShellRequest,
        client_ip: &str,
        request_id: &str,
    ) -> Result<OpenShellResponse> {
        let caps = self
            .permissions
            .evaluate(user_id, &request.resource_type, &request.resource_id);
        if !caps.contains(Capability::Shell) {
            self.auditor.record(
                &format!("user:{user_id}"),
                "shell.open",
                &request.resource_type,
                &request.resource_id,
                "denied",
                serde_json::Value::Null,
                request_id,
            );
            return Err(ControlError::PermissionDenied);
        }

        let (team_id, assignment) = self.resolve_grant(user_id, request, caps.is_global_admin)?;

        let agent = self
            .heartbeats
            .select_agent("ssh")?
            .ok_or_else(|| ControlError::AgentUnavailable("no active agent offers ssh".into()))?;

        let ca_row = self.ca.active_ca()?;
        let validity_s = self.config.session_validity_s.min(ca_row.max_validity_s);

        let principals: Vec<String> = match assignment.as_ref() {
            Some(a) if !a.shell_principals.is_empty() => a.shell_principals.clone(),
            _ => vec![DEFAULT_PRINCIPAL.to_string()],
        };

        let user = self
            .store
            .get_user(user_id)?
            .ok_or_else(|| ControlError::NotFound(format!("user {user_id}")))?;

        let now = Utc::now();
        let session_id = SessionId::generate();
        let key_id = generate_key_id(&user.email, &request.resource_id, now);
        let certificate = self
            .ca
            .sign_session(
                &request.public_key,
                &principals,
                validity_s,
                &key_id,
                Some(&session_id.to_string()),
            )
            .await?;

        let expires_at = now + Duration::seconds(i64::try_from(validity_s).unwrap_or(3600));
        let session = ShellSession {
            session_id,
            user_id: *user_id,
            team_id,
            resource_type: request.resource_type.clone(),
            resource_id: request.resource_id.clone(),
            agent_id: agent.agent_id,
            session_type: request.session_type,
            started_at: now,
            ended_at: None,
            expires_at,
            client_ip: client_ip.to_string(),
            recording_ref: None,
        };
        self.store.put_session(&session)?;

        self.auditor.record(
            &format!("user:{user_id}"),
            "shell.open",
            &request.resource_type,
            &request.resource_id,
            "success",
            serde_json::json!({
                "session_id": session.session_id,
                "agent_id": agent.agent_id,
                "key_id": key_id,
                "principals": principals,
            }),
            request_id,
        );

        Ok(OpenShellResponse {
            session_id: session.session_id,
            agent_host: agent.public_ip,
            agent_port: agent.rssh_port,
            certificate,
            principals,
            expires_at,
        })
    }

    /// Terminate a session on behalf of its owner or a team admin.
    ///
    /// A terminate command is queued for the agent; the session is closed
    /// when the agent confirms via heartbeat, or forcibly after ten
    /// seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown sessions and
    /// [`ControlError::PermissionDenied`] for unauthorized requesters.
    pub fn terminate(
        self: &Arc<Self>,
        session_id: &SessionId,
        requester: &UserId,
        request_id: &str,
    ) -> Result<()> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| ControlError::NotFound(format!("session {session_id}")))?;

        if session.ended_at.is_some() {
            return Ok(());
        }
        if !self.may_terminate(requester, &session)? {
            return Err(ControlError::PermissionDenied);
        }

        self.heartbeats.enqueue(
            session.agent_id,
            AgentCommand::TerminateSession {
                session_id: *session_id,
            },
        );
        self.auditor.record(
            &format!("user:{requester}"),
            "shell.terminate",
            &session.resource_type,
            &session.resource_id,
            "success",
            serde_json::json!({"session_id": session_id}),
            request_id,
        );

        // Force the record closed if the agent does not confirm in time.
        let broker = Arc::clone(self);
        let session_id = *session_id;
        tokio::spawn(async move {
            tokio::time::sleep(FORCED_CLOSE_AFTER).await;
            if let Err(e) = broker.close_session(&session_id, "admin_forced") {
                tracing::error!(session_id = %session_id, error = %e, "forced close failed");
            }
        });

        Ok(())
    }

    /// Close sessions the agent reported ended in its heartbeat.
    pub fn close_from_agent(&self, agent_id: &AgentId, closed: &[SessionId]) {
        for session_id in closed {
            match self.store.get_session(session_id) {
                Ok(Some(session)) if session.agent_id == *agent_id => {
                    if let Err(e) = self.close_session(session_id, "client_disconnect") {
                        tracing::error!(session_id = %session_id, error = %e, "close failed");
                    }
                }
                Ok(_) => {
                    tracing::warn!(
                        session_id = %session_id,
                        agent_id = %agent_id,
                        "agent reported a session it does not own"
                    );
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "session lookup failed");
                }
            }
        }
    }

    /// Close one session if still open. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub fn close_session(&self, session_id: &SessionId, reason: &str) -> Result<()> {
        let Some(mut session) = self.store.get_session(session_id)? else {
            return Ok(());
        };
        if session.ended_at.is_some() {
            return Ok(());
        }

        session.ended_at = Some(Utc::now());
        self.store.put_session(&session)?;
        self.auditor.record(
            "system",
            "shell.close",
            &session.resource_type,
            &session.resource_id,
            "success",
            serde_json::json!({"session_id": session_id, "reason": reason}),
            "-",
        );
        Ok(())
    }

    /// Close every live session past its certificate expiry. Returns the
    /// number closed.
    ///
    /// # Errors
    ///
    /// Returns a store error if the session listing fails.
    pub fn reaper_pass(&self) -> Result<usize> {
        let now = Utc::now();
        let mut reaped = 0;
        for session in self.store.list_active_sessions()? {
            if session.expires_at <= now {
                self.close_session(&session.session_id, "ttl_expired")?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Run the session reaper until cancelled; sweeps every minute.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("session reaper stopping");
                    return;
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
            }
            match self.reaper_pass() {
                Ok(0) => {}
                Ok(reaped) => tracing::info!(reaped, "reaped expired sessions"),
                Err(e) => tracing::error!(error = %e, "session reaper pass failed"),
            }
        }
    }

    /// Resolve the team and assignment the session is recorded under.
    fn resolve_grant(
        &self,
        user_id: &UserId,
        request: &OpenShellRequest,
        is_global_admin: bool,
    ) -> Result<(TeamId, Option<ResourceAssignment>)> {
        if let Some((team_id, assignment)) =
            self.permissions
                .shell_grant(user_id, &request.resource_type, &request.resource_id)
        {
            return Ok((team_id, Some(assignment)));
        }

        if is_global_admin {
            // Global admins bypass the membership requirement; the session
            // still records whichever team the resource is assigned to so
            // principals come from the assignment when one exists.
            for team in self.store.list_teams()? {
                if let Some(assignment) = self.store.get_assignment(
                    &team.id,
                    &request.resource_type,
                    &request.resource_id,
                )? {
                    return Ok((team.id, Some(assignment)));
                }
            }
            return Err(ControlError::Validation(format!(
                "resource {}/{} has no shell assignment",
                request.resource_type, request.resource_id
            )));
        }

        Err(ControlError::PermissionDenied)
    }

    fn may_terminate(&self, requester: &UserId, session: &ShellSession) -> Result<bool> {
        if session.user_id == *requester {
            return Ok(true);
        }
        if let Some(user) = self.store.get_user(requester)? {
            if user.global_roles.contains(&Role::Admin) {
                return Ok(true);
            }
        }
        if let Some(membership) = self.store.get_membership(&session.team_id, requester)? {
            return Ok(matches!(membership.role, TeamRole::Owner | TeamRole::Admin));
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gough_secrets::encrypted::{derive_key, EncryptedDbBackend};
    use gough_secrets::SecretsBackend;
    use gough_store::{
        AccessAgent, AgentStatus, RocksStore, SessionType, Team, TeamMembership, User,
    };
    use ssh_key::private::{KeypairData, RsaKeypair};
    use ssh_key::rand_core::OsRng;
    use ssh_key::PrivateKey;

    struct Fixture {
        _store_dir: tempfile::TempDir,
        _secrets_dir: tempfile::TempDir,
        store: Arc<RocksStore>,
        broker: Arc<SessionBroker<RocksStore>>,
        alice: UserId,
        team: TeamId,
        agent: AgentId,
    }

    async fn fixture() -> Fixture {
        let store_dir = tempfile::tempdir().unwrap();
        let secrets_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(store_dir.path()).unwrap());
        let secrets: Arc<dyn SecretsBackend> = Arc::new(
            EncryptedDbBackend::open(secrets_dir.path(), derive_key(Some("k")).unwrap()).unwrap(),
        );

        let ca = Arc::new(CertificateAuthority::new(Arc::clone(&store), secrets));
        ca.initialize("default", vec!["ubuntu".to_string(), "admin".to_string()], 2048)
            .await
            .unwrap();

        let alice = UserId::generate();
        store
            .put_user(&User {
                id: alice,
                email: "alice@example.com".to_string(),
                password_hash: String::new(),
                active: true,
                unique_token: "t".to_string(),
                global_roles: std::collections::BTreeSet::new(),
                created_at: Utc::now(),
            })
            .unwrap();

        let team = TeamId::generate();
        store
            .put_team(&Team {
                id: team,
                name: "ops".to_string(),
                description: String::new(),
                created_by: alice,
                active: true,
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .put_membership(&TeamMembership {
                team_id: team,
                user_id: alice,
                role: TeamRole::Member,
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .put_assignment(&ResourceAssignment {
                team_id: team,
                resource_type: "vm".to_string(),
                resource_id: "vm-42".to_string(),
                permissions: ["shell", "read"].iter().map(ToString::to_string).collect(),
                shell_principals: vec!["ubuntu".to_string()],
                created_at: Utc::now(),
            })
            .unwrap();

        let agent = AgentId::generate();
        store
            .put_agent(&AccessAgent {
                agent_id: agent,
                hostname: "agent-1".to_string(),
                public_ip: "198.51.100.7".to_string(),
                rssh_port: 2222,
                enrollment_key_hash: "h".to_string(),
                refresh_token_id: None,
                last_heartbeat_at: Some(Utc::now()),
                status: AgentStatus::Active,
                capabilities: vec!["ssh".to_string()],
                agent_version: "1.0.0".to_string(),
                active_sessions: 0,
                created_at: Utc::now(),
            })
            .unwrap();

        let config = ControlConfig::default();
        let permissions = PermissionEvaluator::new(Arc::clone(&store));
        let heartbeats = Arc::new(Heartbeats::new(Arc::clone(&store), config.clone()));
        let auditor = Auditor::new(Arc::clone(&store));
        let broker = Arc::new(SessionBroker::new(
            Arc::clone(&store),
            ca,
            permissions,
            heartbeats,
            auditor,
            config,
        ));

        Fixture {
            _store_dir: store_dir,
            _secrets_dir: secrets_dir,
            store,
            broker,
            alice,
            team,
            agent,
        }
    }

    fn public_key() -> String {
        let keypair = RsaKeypair::random(&mut OsRng, 2048).unwrap();
        PrivateKey::new(KeypairData::Rsa(keypair), "user")
            .unwrap()
            .public_key()
            .to_openssh()
            .unwrap()
    }

    fn shell_request() -> OpenShellRequest {
        OpenShellRequest {
            resource_type: "vm".to_string(),
            resource_id: "vm-42".to_string(),
            session_type: SessionType::Ssh,
            public_key: public_key(),
        }
    }

    #[tokio::test]
    async fn open_shell_happy_path() {
        let f = fixture().await;

        let response = f
            .broker
            .open_shell(&f.alice, &shell_request(), "198.51.100.4", "req-1")
            .await
            .unwrap();

        assert!(response
            .certificate
            .starts_with("ssh-rsa-cert-v01@openssh.com "));
        assert_eq!(response.agent_host, "198.51.100.7");
        assert_eq!(response.agent_port, 2222);
        assert_eq!(response.principals, vec!["ubuntu"]);
        let remaining = response.expires_at - Utc::now();
        assert!(remaining <= Duration::seconds(3600));
        assert!(remaining > Duration::seconds(3500));

        let session = f.store.get_session(&response.session_id).unwrap().unwrap();
        assert_eq!(session.user_id, f.alice);
        assert_eq!(session.team_id, f.team);
        assert_eq!(session.agent_id, f.agent);
        assert!(session.ended_at.is_none());

        let audit = f.store.recent_audit(5).unwrap();
        assert!(audit.iter().any(|e| e.action == "shell.open"));
    }

    #[tokio::test]
    async fn no_shell_cap_is_denied() {
        let f = fixture().await;
        let stranger = UserId::generate();
        f.store
            .put_user(&User {
                id: stranger,
                email: "bob@example.com".to_string(),
                password_hash: String::new(),
                active: true,
                unique_token: "t".to_string(),
                global_roles: std::collections::BTreeSet::new(),
                created_at: Utc::now(),
            })
            .unwrap();

        let result = f
            .broker
            .open_shell(&stranger, &shell_request(), "198.51.100.4", "req-1")
            .await;
        assert!(matches!(result, Err(ControlError::PermissionDenied)));
    }

    #[tokio::test]
    async fn suspended_agent_is_not_selected() {
        let f = fixture().await;
        let mut agent = f.store.get_agent(&f.agent).unwrap().unwrap();
        agent.status = AgentStatus::Suspended;
        f.store.put_agent(&agent).unwrap();

        let result = f
            .broker
            .open_shell(&f.alice, &shell_request(), "198.51.100.4", "req-1")
            .await;
        assert!(matches!(result, Err(ControlError::AgentUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn admin_terminate_forces_close() {
        let f = fixture().await;
        let response = f
            .broker
            .open_shell(&f.alice, &shell_request(), "198.51.100.4", "req-1")
            .await
            .unwrap();

        f.broker
            .terminate(&response.session_id, &f.alice, "req-2")
            .unwrap();

        // The agent never confirms; the forced close lands after 10 s.
        tokio::time::sleep(std::time::Duration::from_secs(11)).await;
        let session = f.store.get_session(&response.session_id).unwrap().unwrap();
        assert!(session.ended_at.is_some());
        assert!(session.ended_at.unwrap() >= session.started_at);
    }

    #[tokio::test]
    async fn stranger_cannot_terminate() {
        let f = fixture().await;
        let response = f
            .broker
            .open_shell(&f.alice, &shell_request(), "198.51.100.4", "req-1")
            .await
            .unwrap();

        let stranger = UserId::generate();
        f.store
            .put_user(&User {
                id: stranger,
                email: "mallory@example.com".to_string(),
                password_hash: String::new(),
                active: true,
                unique_token: "t".to_string(),
                global_roles: std::collections::BTreeSet::new(),
                created_at: Utc::now(),
            })
            .unwrap();

        let result = f.broker.terminate(&response.session_id, &stranger, "req-2");
        assert!(matches!(result, Err(ControlError::PermissionDenied)));
    }

    #[tokio::test]
    async fn reaper_closes_expired_sessions() {
        let f = fixture().await;
        let response = f
            .broker
            .open_shell(&f.alice, &shell_request(), "198.51.100.4", "req-1")
            .await
            .unwrap();

        // Not expired yet.
        assert_eq!(f.broker.reaper_pass().unwrap(), 0);

        let mut session = f.store.get_session(&response.session_id).unwrap().unwrap();
        session.expires_at = Utc::now() - Duration::seconds(1);
        f.store.put_session(&session).unwrap();

        assert_eq!(f.broker.reaper_pass().unwrap(), 1);
        let session = f.store.get_session(&response.session_id).unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn close_from_agent_ignores_foreign_sessions() {
        let f = fixture().await;
        let response = f
            .broker
            .open_shell(&f.alice, &shell_request(), "198.51.100.4", "req-1")
            .await
            .unwrap();

        // Wrong agent reports the close; nothing happens.
        let other_agent = AgentId::generate();
        f.broker.close_from_agent(&other_agent, &[response.session_id]);
        let session = f.store.get_session(&response.session_id).unwrap().unwrap();
        assert!(session.ended_at.is_none());

        // The owning agent's report closes it.
        f.broker.close_from_agent(&f.agent, &[response.session_id]);
        let session = f.store.get_session(&response.session_id).unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }
}
