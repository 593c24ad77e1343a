//! Authentication extractors and per-request context.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;

use gough_control::tokens::TokenKind;
use gough_control::Subject;
use gough_core::{AgentId, UserId};
use gough_store::{AgentStatus, Role, Store};

use crate::error::ApiError;
use crate::state::GatewayState;

/// Per-request context: the request id stamped into every response and the
/// client address used for rate limiting and session records.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id for log and audit correlation.
    pub request_id: String,
    /// Best-effort client IP.
    pub client_ip: String,
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Reuse the id if another extractor already created one.
        if let Some(existing) = parts.extensions.get::<RequestContext>() {
            return Ok(existing.clone());
        }

        let client_ip = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let context = Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            client_ip,
        };
        parts.extensions.insert(context.clone());
        Ok(context)
    }
}

/// An authenticated user extracted from a bearer access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user's id.
    pub user_id: UserId,
    /// The user's email.
    pub email: String,
    /// Whether the user holds the global admin role.
    pub is_admin: bool,
    /// Whether the user holds global admin or maintainer.
    pub is_maintainer: bool,
}

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))
}

impl<St: Store + 'static> FromRequestParts<Arc<GatewayState<St>>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState<St>>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.tokens.verify(token, TokenKind::Access)?;
        let Subject::User(user_id) = Subject::parse(&claims.sub)? else {
            return Err(ApiError::Unauthorized("not a user token".into()));
        };

        let user = state
            .store
            .get_user(&user_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .filter(|u| u.active)
            .ok_or_else(|| ApiError::Unauthorized("account deactivated".into()))?;

        // Tokens minted before the last logout carry a stale handle.
        if claims.ut.as_deref() != Some(user.unique_token.as_str()) {
            return Err(ApiError::Unauthorized("session invalidated".into()));
        }

        let is_admin = user.global_roles.contains(&Role::Admin);
        Ok(Self {
            user_id,
            email: user.email,
            is_admin,
            is_maintainer: is_admin || user.global_roles.contains(&Role::Maintainer),
        })
    }
}

/// An authenticated agent extracted from a bearer access token.
#[derive(Debug, Clone)]
pub struct AuthAgent {
    /// The agent's id.
    pub agent_id: AgentId,
    /// The agent's current status.
    pub status: AgentStatus,
}

impl<St: Store + 'static> FromRequestParts<Arc<GatewayState<St>>> for AuthAgent {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState<St>>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.tokens.verify(token, TokenKind::Access)?;
        let Subject::Agent(agent_id) = Subject::parse(&claims.sub)? else {
            return Err(ApiError::Unauthorized("not an agent token".into()));
        };

        let agent = state
            .store
            .get_agent(&agent_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or_else(|| ApiError::Unauthorized("unknown agent".into()))?;

        Ok(Self {
            agent_id,
            status: agent.status,
        })
    }
}
