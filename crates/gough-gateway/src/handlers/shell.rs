//! Shell session endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use gough_control::types::{OpenShellRequest, OpenShellResponse};
use gough_core::SessionId;
use gough_store::Store;

use crate::auth::{AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

/// `POST /api/v1/shell/sessions`
pub async fn open<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Json(request): Json<OpenShellRequest>,
) -> Result<(StatusCode, Json<Envelope<OpenShellResponse>>), ApiError> {
    if request.public_key.trim().is_empty() {
        return Err(ApiError::BadRequest("public_key is required".into()));
    }

    let response = state
        .broker
        .open_shell(&caller.user_id, &request, &ctx.client_ip, &ctx.request_id)
        .await?;

    state.metrics.sessions_opened.inc();
    state.metrics.sessions_live.inc();

    Ok((StatusCode::CREATED, envelope(&ctx, response)))
}

#[derive(Debug, Serialize)]
pub(crate) struct TerminateResponse {
    terminated: bool,
}

/// `DELETE /api/v1/shell/sessions/{id}`
pub async fn terminate<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Envelope<TerminateResponse>>, ApiError> {
    state
        .broker
        .terminate(&session_id, &caller.user_id, &ctx.request_id)?;
    state.metrics.sessions_live.dec();
    Ok(envelope(&ctx, TerminateResponse { terminated: true }))
}
