//! Agent enrollment and identity.
//!
//! Enrollment keys are single-use: thirty-two random bytes whose hex form
//! is shown to the admin exactly once, with only the SHA-256 stored.
//! Redeeming one creates the agent and mints its first token pair. From
//! then on the agent lives on rotating refresh tokens; presenting a revoked
//! refresh token is treated as credential theft and suspends the agent.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use gough_core::{AgentId, UserId};
use gough_store::{AccessAgent, AgentStatus, EnrollmentKey, RefreshToken, Store, User};

use crate::error::{ControlError, Result};
use crate::tokens::{Subject, TokenKind, TokenPair, TokenService};
use crate::types::{AgentConfigPayload, EnrollRequest, EnrollResponse};
use crate::ControlConfig;

/// Agent enrollment and token rotation.
pub struct AgentIdentity<S: Store> {
    store: Arc<S>,
    tokens: Arc<TokenService>,
    config: ControlConfig,
}

/// Hex SHA-256 of an enrollment key's plaintext.
#[must_use]
pub fn hash_enrollment_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

impl<S: Store> AgentIdentity<S> {
    /// Create the identity service.
    #[must_use]
    pub fn new(store: Arc<S>, tokens: Arc<TokenService>, config: ControlConfig) -> Self {
        Self {
            store,
            tokens,
            config,
        }
    }

    /// Mint a new enrollment key, returning the plaintext exactly once.
    ///
    /// # Errors
    ///
    /// Returns a store error if the key record cannot be persisted.
    pub fn mint_enrollment_key(&self, created_by: UserId) -> Result<String> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let plaintext = hex::encode(bytes);

        let now = Utc::now();
        let record = EnrollmentKey {
            key_hash: hash_enrollment_key(&plaintext),
            created_by,
            created_at: now,
            expires_at: now
                + Duration::seconds(
                    i64::try_from(self.config.enrollment_key_ttl_s).unwrap_or(86_400),
                ),
            used: false,
            used_by_agent: None,
        };
        self.store.put_enrollment_key(&record)?;

        tracing::info!(created_by = %created_by, "minted enrollment key");
        Ok(plaintext)
    }

    /// Redeem an enrollment key and create the agent.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for unknown or expired keys and
    /// [`ControlError::Conflict`] for already-used keys.
    pub fn enroll(
        &self,
        plaintext_key: &str,
        request: &EnrollRequest,
        ca_public_key: String,
    ) -> Result<EnrollResponse> {
        let key_hash = hash_enrollment_key(plaintext_key);
        let mut key = self
            .store
            .get_enrollment_key(&key_hash)?
            .ok_or_else(|| ControlError::Auth("invalid enrollment key".into()))?;

        if key.used {
            return Err(ControlError::Conflict(
                "enrollment key already used".into(),
            ));
        }
        if key.expires_at < Utc::now() {
            return Err(ControlError::Auth("enrollment key expired".into()));
        }

        let agent_id = AgentId::generate();
        let pair = self.tokens.issue_pair(&Subject::Agent(agent_id), None)?;

        let now = Utc::now();
        let agent = AccessAgent {
            agent_id,
            hostname: request.hostname.clone(),
            public_ip: request.ip_address.clone(),
            rssh_port: request.rssh_port,
            enrollment_key_hash: key_hash,
            refresh_token_id: Some(pair.refresh_jti),
            last_heartbeat_at: None,
            status: AgentStatus::Enrolled,
            capabilities: request.capabilities.clone(),
            agent_version: request.agent_version.clone(),
            active_sessions: 0,
            created_at: now,
        };
        self.store.put_agent(&agent)?;
        self.record_refresh_token(&pair, &Subject::Agent(agent_id))?;

        key.used = true;
        key.used_by_agent = Some(agent_id);
        self.store.put_enrollment_key(&key)?;

        tracing::info!(
            agent_id = %agent_id,
            hostname = %request.hostname,
            "agent enrolled"
        );

        Ok(EnrollResponse {
            agent_id,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            ca_public_key,
            config: AgentConfigPayload {
                heartbeat_interval_s: self.config.heartbeat_interval_s,
            },
        })
    }

    /// Rotate an agent's token pair.
    ///
    /// The presented refresh token's jti is revoked and a new pair issued.
    /// Presenting an already-revoked jti suspends the agent.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for invalid, expired, unknown, or
    /// reused refresh tokens.
    pub fn refresh_agent(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.tokens.verify(refresh_token, TokenKind::Refresh)?;
        let Subject::Agent(agent_id) = Subject::parse(&claims.sub)? else {
            return Err(ControlError::Auth("not an agent token".into()));
        };

        let record = self
            .store
            .get_refresh_token(&claims.jti)?
            .ok_or_else(|| ControlError::Auth("unknown refresh token".into()))?;

        if record.revoked {
            // Reuse of a rotated-out token means the token leaked somewhere;
            // the agent loses its standing until an operator intervenes.
            if let Some(mut agent) = self.store.get_agent(&agent_id)? {
                agent.status = AgentStatus::Suspended;
                self.store.put_agent(&agent)?;
            }
            tracing::warn!(
                agent_id = %agent_id,
                jti = %claims.jti,
                "revoked refresh token reused; agent suspended"
            );
            return Err(ControlError::Auth("refresh token revoked".into()));
        }

        let mut agent = self
            .store
            .get_agent(&agent_id)?
            .ok_or_else(|| ControlError::Auth("unknown agent".into()))?;
        if agent.status == AgentStatus::Suspended {
            return Err(ControlError::Auth("agent suspended".into()));
        }

        self.revoke_refresh_token(record)?;

        let pair = self.tokens.issue_pair(&Subject::Agent(agent_id), None)?;
        self.record_refresh_token(&pair, &Subject::Agent(agent_id))?;
        agent.refresh_token_id = Some(pair.refresh_jti);
        self.store.put_agent(&agent)?;

        Ok(pair)
    }

    /// Verify a user's password and issue a token pair.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for unknown emails, bad passwords, or
    /// deactivated accounts.
    pub fn login(&self, email: &str, password: &str) -> Result<(User, TokenPair)> {
        let user = self
            .store
            .get_user_by_email(email)?
            .ok_or_else(|| ControlError::Auth("invalid credentials".into()))?;

        if !user.active {
            return Err(ControlError::Auth("account deactivated".into()));
        }
        let valid = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| ControlError::Internal(format!("password verification failed: {e}")))?;
        if !valid {
            return Err(ControlError::Auth("invalid credentials".into()));
        }

        let pair = self
            .tokens
            .issue_pair(&Subject::User(user.id), Some(&user.unique_token))?;
        self.record_refresh_token(&pair, &Subject::User(user.id))?;
        Ok((user, pair))
    }

    /// Rotate a user's token pair.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for invalid or rotated-out tokens.
    pub fn refresh_user(&self, refresh_token: &str) -> Result<(User, TokenPair)> {
        let claims = self.tokens.verify(refresh_token, TokenKind::Refresh)?;
        let Subject::User(user_id) = Subject::parse(&claims.sub)? else {
            return Err(ControlError::Auth("not a user token".into()));
        };

        let record = self
            .store
            .get_refresh_token(&claims.jti)?
            .ok_or_else(|| ControlError::Auth("unknown refresh token".into()))?;
        if record.revoked {
            return Err(ControlError::Auth("refresh token revoked".into()));
        }

        let user = self
            .store
            .get_user(&user_id)?
            .filter(|u| u.active)
            .ok_or_else(|| ControlError::Auth("account deactivated".into()))?;
        if claims.ut.as_deref() != Some(user.unique_token.as_str()) {
            return Err(ControlError::Auth("session invalidated".into()));
        }

        self.revoke_refresh_token(record)?;
        let pair = self
            .tokens
            .issue_pair(&Subject::User(user.id), Some(&user.unique_token))?;
        self.record_refresh_token(&pair, &Subject::User(user.id))?;
        Ok((user, pair))
    }

    /// Invalidate every outstanding token for a user by rolling the
    /// session-invalidation handle.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown users.
    pub fn logout(&self, user_id: &UserId) -> Result<()> {
        let mut user = self
            .store
            .get_user(user_id)?
            .ok_or_else(|| ControlError::NotFound(format!("user {user_id}")))?;
        user.unique_token = uuid::Uuid::new_v4().to_string();
        self.store.put_user(&user)?;
        Ok(())
    }

    fn record_refresh_token(&self, pair: &TokenPair, subject: &Subject) -> Result<()> {
        self.store.put_refresh_token(&RefreshToken {
            jti: pair.refresh_jti,
            subject: subject.encode(),
            issued_at: Utc::now(),
            expires_at: pair.refresh_expires_at,
            revoked: false,
        })?;
        Ok(())
    }

    fn revoke_refresh_token(&self, mut record: RefreshToken) -> Result<()> {
        record.revoked = true;
        self.store.put_refresh_token(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gough_store::RocksStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<RocksStore>,
        identity: AgentIdentity<RocksStore>,
        admin: UserId,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let tokens = Arc::new(TokenService::new("test-secret", 900, 2_592_000));
        let identity = AgentIdentity::new(Arc::clone(&store), tokens, ControlConfig::default());

        let admin = UserId::generate();
        store
            .put_user(&User {
                id: admin,
                email: "admin@example.com".to_string(),
                password_hash: bcrypt::hash("hunter2", 4).unwrap(),
                active: true,
                unique_token: "ut-1".to_string(),
                global_roles: std::collections::BTreeSet::new(),
                created_at: Utc::now(),
            })
            .unwrap();

        Fixture {
            _dir: dir,
            store,
            identity,
            admin,
        }
    }

    fn enroll_request() -> EnrollRequest {
        EnrollRequest {
            hostname: "agent-1".to_string(),
            ip_address: "10.0.0.5".to_string(),
            agent_version: "1.0.0".to_string(),
            capabilities: vec!["ssh".to_string()],
            rssh_port: 2222,
        }
    }

    #[test]
    fn enrollment_key_is_hex_and_single_use() {
        let f = fixture();
        let plaintext = f.identity.mint_enrollment_key(f.admin).unwrap();
        assert_eq!(plaintext.len(), 64);
        assert!(plaintext.chars().all(|c| c.is_ascii_hexdigit()));

        let response = f
            .identity
            .enroll(&plaintext, &enroll_request(), "ssh-rsa AAAA".into())
            .unwrap();
        assert!(!response.access_token.is_empty());
        assert_eq!(response.config.heartbeat_interval_s, 30);

        let agent = f.store.get_agent(&response.agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Enrolled);

        // Re-enrolling on the same key conflicts.
        let second = f
            .identity
            .enroll(&plaintext, &enroll_request(), "ssh-rsa AAAA".into());
        assert!(matches!(second, Err(ControlError::Conflict(_))));
    }

    #[test]
    fn unknown_key_is_auth_error() {
        let f = fixture();
        let result = f
            .identity
            .enroll("deadbeef", &enroll_request(), "ssh-rsa AAAA".into());
        assert!(matches!(result, Err(ControlError::Auth(_))));
    }

    #[test]
    fn refresh_rotation_and_reuse_suspends() {
        let f = fixture();
        let plaintext = f.identity.mint_enrollment_key(f.admin).unwrap();
        let enrolled = f
            .identity
            .enroll(&plaintext, &enroll_request(), "ssh-rsa AAAA".into())
            .unwrap();

        // First rotation succeeds.
        let rotated = f.identity.refresh_agent(&enrolled.refresh_token).unwrap();
        assert_ne!(rotated.refresh_token, enrolled.refresh_token);

        // Replaying the original refresh token is reuse: rejected, and the
        // agent is suspended.
        let replay = f.identity.refresh_agent(&enrolled.refresh_token);
        assert!(matches!(replay, Err(ControlError::Auth(_))));

        let agent = f.store.get_agent(&enrolled.agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Suspended);

        // The suspended agent cannot rotate even with the fresh token.
        let after = f.identity.refresh_agent(&rotated.refresh_token);
        assert!(matches!(after, Err(ControlError::Auth(_))));
    }

    #[test]
    fn login_and_logout_invalidate_tokens() {
        let f = fixture();
        let (user, pair) = f.identity.login("admin@example.com", "hunter2").unwrap();
        assert_eq!(user.id, f.admin);

        // Refresh works before logout.
        let (_, rotated) = f.identity.refresh_user(&pair.refresh_token).unwrap();

        f.identity.logout(&f.admin).unwrap();

        // The rotated refresh token dies with the old unique_token.
        let result = f.identity.refresh_user(&rotated.refresh_token);
        assert!(matches!(result, Err(ControlError::Auth(_))));
    }

    #[test]
    fn bad_password_is_rejected() {
        let f = fixture();
        let result = f.identity.login("admin@example.com", "wrong");
        assert!(matches!(result, Err(ControlError::Auth(_))));
        let result = f.identity.login("nobody@example.com", "hunter2");
        assert!(matches!(result, Err(ControlError::Auth(_))));
    }
}
