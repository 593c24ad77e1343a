//! Login, refresh, and logout.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use gough_store::Store;

use crate::auth::{AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /api/v1/auth/login`
pub async fn login<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Envelope<TokenResponse>>, ApiError> {
    let result = state.identity.login(&request.email, &request.password);

    let outcome = if result.is_ok() { "success" } else { "failure" };
    state.auditor.record(
        &format!("email:{}", request.email),
        "auth.login",
        "user",
        &request.email,
        outcome,
        serde_json::json!({"client_ip": ctx.client_ip}),
        &ctx.request_id,
    );

    let (_user, pair) = result?;
    Ok(envelope(
        &ctx,
        TokenResponse {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer",
            expires_at: pair.access_expires_at,
        },
    ))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshRequest {
    refresh_token: String,
}

/// `POST /api/v1/auth/refresh`
pub async fn refresh<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<Envelope<TokenResponse>>, ApiError> {
    let (_user, pair) = state.identity.refresh_user(&request.refresh_token)?;
    Ok(envelope(
        &ctx,
        TokenResponse {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer",
            expires_at: pair.access_expires_at,
        },
    ))
}

#[derive(Debug, Serialize)]
pub(crate) struct LogoutResponse {
    logged_out: bool,
}

/// `POST /api/v1/auth/logout`
pub async fn logout<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    user: AuthUser,
) -> Result<Json<Envelope<LogoutResponse>>, ApiError> {
    state.identity.logout(&user.user_id)?;
    state.auditor.record(
        &format!("user:{}", user.user_id),
        "auth.logout",
        "user",
        &user.email,
        "success",
        serde_json::Value::Null,
        &ctx.request_id,
    );
    Ok(envelope(&ctx, LogoutResponse { logged_out: true }))
}
