//! Agent enrollment, token rotation, and heartbeat endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use gough_control::types::{EnrollRequest, EnrollResponse, HeartbeatRequest, HeartbeatResponse};
use gough_core::AgentId;
use gough_store::{AgentStatus, Store};

use crate::auth::{AuthAgent, AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

#[derive(Debug, Serialize)]
pub(crate) struct EnrollmentKeyResponse {
    /// Shown exactly once; only its hash is stored.
    enrollment_key: String,
    expires_in_s: u64,
}

/// `POST /api/v1/enrollment-keys` (admin)
pub async fn mint_enrollment_key<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
) -> Result<(StatusCode, Json<Envelope<EnrollmentKeyResponse>>), ApiError> {
    if !caller.is_admin {
        return Err(ApiError::Forbidden);
    }

    let plaintext = state.identity.mint_enrollment_key(caller.user_id)?;
    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "agent.enrollment_key.mint",
        "agent",
        "-",
        "success",
        serde_json::Value::Null,
        &ctx.request_id,
    );

    Ok((
        StatusCode::CREATED,
        envelope(
            &ctx,
            EnrollmentKeyResponse {
                enrollment_key: plaintext,
                expires_in_s: 24 * 3600,
            },
        ),
    ))
}

/// `POST /api/v1/agents/enroll`
///
/// Authenticated by the `X-Enrollment-Key` header, not a bearer token.
pub async fn enroll<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    headers: HeaderMap,
    Json(request): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Envelope<EnrollResponse>>), ApiError> {
    let key = headers
        .get("x-enrollment-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-Enrollment-Key".into()))?;

    let ca_public_key = state
        .ca
        .public_key()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let response = state.identity.enroll(key, &request, ca_public_key)?;

    state.auditor.record(
        &format!("agent:{}", response.agent_id),
        "agent.enroll",
        "agent",
        &request.hostname,
        "success",
        serde_json::json!({"ip_address": request.ip_address, "version": request.agent_version}),
        &ctx.request_id,
    );

    Ok((StatusCode::CREATED, envelope(&ctx, response)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AgentRefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct AgentRefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /api/v1/agents/refresh`
pub async fn refresh<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    Json(request): Json<AgentRefreshRequest>,
) -> Result<Json<Envelope<AgentRefreshResponse>>, ApiError> {
    let pair = state.identity.refresh_agent(&request.refresh_token)?;
    Ok(envelope(
        &ctx,
        AgentRefreshResponse {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: pair.access_expires_at,
        },
    ))
}

/// `POST /api/v1/agents/heartbeat`
pub async fn heartbeat<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    agent: AuthAgent,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<Envelope<HeartbeatResponse>>, ApiError> {
    if agent.status == AgentStatus::Suspended {
        return Err(ApiError::Forbidden);
    }
    // The body names the agent too, but the token decides identity.
    if request.agent_id != agent.agent_id {
        return Err(ApiError::BadRequest("agent_id does not match token".into()));
    }

    let (response, closed_sessions) = state.heartbeats.process(&agent.agent_id, &request)?;
    if !closed_sessions.is_empty() {
        state.broker.close_from_agent(&agent.agent_id, &closed_sessions);
    }
    state.metrics.heartbeats.inc();

    Ok(envelope(&ctx, response))
}

#[derive(Debug, Serialize)]
pub(crate) struct AgentView {
    agent_id: AgentId,
    hostname: String,
    public_ip: String,
    status: AgentStatus,
    capabilities: Vec<String>,
    active_sessions: u32,
    last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AgentList {
    agents: Vec<AgentView>,
}

/// `GET /api/v1/agents` (maintainer)
pub async fn list<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
) -> Result<Json<Envelope<AgentList>>, ApiError> {
    if !caller.is_maintainer {
        return Err(ApiError::Forbidden);
    }
    let agents = state
        .store
        .list_agents()
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .into_iter()
        .map(|a| AgentView {
            agent_id: a.agent_id,
            hostname: a.hostname,
            public_ip: a.public_ip,
            status: a.status,
            capabilities: a.capabilities,
            active_sessions: a.active_sessions,
            last_heartbeat_at: a.last_heartbeat_at,
        })
        .collect();
    Ok(envelope(&ctx, AgentList { agents }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SetAgentStatusRequest {
    status: AgentStatus,
}

/// `POST /api/v1/agents/{id}/status` (admin): administrative suspension
/// and reinstatement.
pub async fn set_status<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    axum::extract::Path(agent_id): axum::extract::Path<AgentId>,
    Json(request): Json<SetAgentStatusRequest>,
) -> Result<Json<Envelope<AgentView>>, ApiError> {
    if !caller.is_admin {
        return Err(ApiError::Forbidden);
    }
    if !matches!(request.status, AgentStatus::Suspended | AgentStatus::Active) {
        return Err(ApiError::BadRequest(
            "status must be suspended or active".into(),
        ));
    }

    let mut agent = state
        .store
        .get_agent(&agent_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id}")))?;
    agent.status = request.status;
    state
        .store
        .put_agent(&agent)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "agent.set_status",
        "agent",
        &agent_id.to_string(),
        "success",
        serde_json::json!({"status": request.status}),
        &ctx.request_id,
    );

    Ok(envelope(
        &ctx,
        AgentView {
            agent_id: agent.agent_id,
            hostname: agent.hostname,
            public_ip: agent.public_ip,
            status: agent.status,
            capabilities: agent.capabilities,
            active_sessions: agent.active_sessions,
            last_heartbeat_at: agent.last_heartbeat_at,
        },
    ))
}
