//! JWT issuing and verification.
//!
//! The control plane is its own token issuer: HS256 over `JWT_SECRET_KEY`,
//! short-lived access tokens and long-lived refresh tokens with a rotating
//! jti recorded in the store. User tokens additionally carry the user's
//! `unique_token`, so regenerating that value invalidates every token the
//! user holds without any token-side state.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use gough_core::{AgentId, UserId};

use crate::error::{ControlError, Result};

const ISSUER: &str = "gough";

/// Kind of token, embedded in the claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Short-lived token for API calls.
    Access,
    /// Long-lived token exchanged for new pairs.
    Refresh,
}

/// The principal a token was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// A human user.
    User(UserId),
    /// An access agent.
    Agent(AgentId),
}

impl Subject {
    /// The `sub` claim encoding.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Agent(id) => format!("agent:{id}"),
        }
    }

    /// Parse a `sub` claim.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for malformed subjects.
    pub fn parse(sub: &str) -> Result<Self> {
        if let Some(id) = sub.strip_prefix("user:") {
            let id = id
                .parse()
                .map_err(|_| ControlError::Auth("malformed subject".into()))?;
            return Ok(Self::User(id));
        }
        if let Some(id) = sub.strip_prefix("agent:") {
            let id = id
                .parse()
                .map_err(|_| ControlError::Auth("malformed subject".into()))?;
            return Ok(Self::Agent(id));
        }
        Err(ControlError::Auth("malformed subject".into()))
    }
}

/// Claims carried by every gough token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    pub iss: String,
    /// Subject (`user:<id>` or `agent:<id>`).
    pub sub: String,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issue time (unix seconds).
    pub iat: i64,
    /// Token id; refresh jtis are recorded for rotation.
    pub jti: uuid::Uuid,
    /// Access or refresh.
    pub kind: TokenKind,
    /// The user's session-invalidation handle; absent on agent tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ut: Option<String>,
}

/// An issued access/refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// The access token.
    pub access_token: String,
    /// The refresh token.
    pub refresh_token: String,
    /// jti of the refresh token, recorded in the store.
    pub refresh_jti: uuid::Uuid,
    /// Refresh token expiry.
    pub refresh_expires_at: DateTime<Utc>,
    /// Access token expiry.
    pub access_expires_at: DateTime<Utc>,
}

/// HS256 token service.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    /// Create a service from the shared secret and TTLs in seconds.
    #[must_use]
    pub fn new(secret: &str, access_ttl_s: u64, refresh_ttl_s: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::seconds(i64::try_from(access_ttl_s).unwrap_or(900)),
            refresh_ttl: Duration::seconds(i64::try_from(refresh_ttl_s).unwrap_or(2_592_000)),
        }
    }

    /// Issue a fresh access/refresh pair for a subject.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Internal`] if encoding fails.
    pub fn issue_pair(&self, subject: &Subject, unique_token: Option<&str>) -> Result<TokenPair> {
        let now = Utc::now();
        let access_expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;
        let refresh_jti = uuid::Uuid::new_v4();

        let access = self.encode_claims(&Claims {
            iss: ISSUER.to_string(),
            sub: subject.encode(),
            exp: access_expires_at.timestamp(),
            iat: now.timestamp(),
            jti: uuid::Uuid::new_v4(),
            kind: TokenKind::Access,
            ut: unique_token.map(ToString::to_string),
        })?;
        let refresh = self.encode_claims(&Claims {
            iss: ISSUER.to_string(),
            sub: subject.encode(),
            exp: refresh_expires_at.timestamp(),
            iat: now.timestamp(),
            jti: refresh_jti,
            kind: TokenKind::Refresh,
            ut: unique_token.map(ToString::to_string),
        })?;

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            refresh_jti,
            refresh_expires_at,
            access_expires_at,
        })
    }

    /// Verify a token and require the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for invalid, expired, or wrong-kind
    /// tokens.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ControlError::Auth("token expired".into())
                }
                _ => ControlError::Auth("invalid token".into()),
            }
        })?;

        if data.claims.kind != expected {
            return Err(ControlError::Auth("wrong token kind".into()));
        }
        Ok(data.claims)
    }

    fn encode_claims(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| ControlError::Internal(format!("token encoding failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", 900, 2_592_000)
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let service = service();
        let subject = Subject::Agent(AgentId::generate());
        let pair = service.issue_pair(&subject, None).unwrap();

        let access = service.verify(&pair.access_token, TokenKind::Access).unwrap();
        assert_eq!(Subject::parse(&access.sub).unwrap(), subject);
        assert_eq!(access.kind, TokenKind::Access);

        let refresh = service
            .verify(&pair.refresh_token, TokenKind::Refresh)
            .unwrap();
        assert_eq!(refresh.jti, pair.refresh_jti);
    }

    #[test]
    fn access_token_is_not_a_refresh_token() {
        let service = service();
        let pair = service
            .issue_pair(&Subject::User(UserId::generate()), Some("ut-1"))
            .unwrap();

        let result = service.verify(&pair.access_token, TokenKind::Refresh);
        assert!(matches!(result, Err(ControlError::Auth(_))));
    }

    #[test]
    fn wrong_secret_fails() {
        let pair = service()
            .issue_pair(&Subject::User(UserId::generate()), None)
            .unwrap();
        let other = TokenService::new("different-secret", 900, 2_592_000);
        assert!(other.verify(&pair.access_token, TokenKind::Access).is_err());
    }

    #[test]
    fn user_tokens_carry_unique_token() {
        let service = service();
        let pair = service
            .issue_pair(&Subject::User(UserId::generate()), Some("handle-7"))
            .unwrap();
        let claims = service.verify(&pair.access_token, TokenKind::Access).unwrap();
        assert_eq!(claims.ut.as_deref(), Some("handle-7"));
    }

    #[test]
    fn subject_parse_rejects_garbage() {
        assert!(Subject::parse("user:not-a-uuid").is_err());
        assert!(Subject::parse("machine:123").is_err());
    }
}
