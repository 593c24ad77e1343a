//! User management (global-admin only).

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use gough_core::UserId;
use gough_store::{Role, Store, User};

use crate::auth::{AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

#[derive(Debug, Serialize)]
pub(crate) struct UserView {
    id: UserId,
    email: String,
    active: bool,
    global_roles: BTreeSet<Role>,
    created_at: chrono::DateTime<Utc>,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            active: user.active,
            global_roles: user.global_roles,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UserList {
    users: Vec<UserView>,
}

fn require_admin(user: &AuthUser) -> Result<(), ApiError> {
    if user.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// `GET /api/v1/users`
pub async fn list<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
) -> Result<Json<Envelope<UserList>>, ApiError> {
    require_admin(&caller)?;
    let users = state
        .store
        .list_users()
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .into_iter()
        .map(UserView::from)
        .collect();
    Ok(envelope(&ctx, UserList { users }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateUserRequest {
    email: String,
    password: String,
    #[serde(default)]
    global_roles: BTreeSet<Role>,
}

/// `POST /api/v1/users`
pub async fn create<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<Envelope<UserView>>), ApiError> {
    require_admin(&caller)?;

    if !request.email.contains('@') {
        return Err(ApiError::BadRequest("invalid email".into()));
    }
    if request.password.len() < 8 {
        return Err(ApiError::BadRequest("password too short".into()));
    }

    let password_hash = bcrypt::hash(&request.password, bcrypt::DEFAULT_COST)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let user = User {
        id: UserId::generate(),
        email: request.email,
        password_hash,
        active: true,
        unique_token: uuid::Uuid::new_v4().to_string(),
        global_roles: request.global_roles,
        created_at: Utc::now(),
    };

    state.store.put_user(&user).map_err(|e| match e {
        gough_store::StoreError::Conflict(msg) => ApiError::Conflict(msg),
        other => ApiError::Internal(other.to_string()),
    })?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "user.create",
        "user",
        &user.email,
        "success",
        serde_json::Value::Null,
        &ctx.request_id,
    );

    Ok((StatusCode::CREATED, envelope(&ctx, UserView::from(user))))
}

/// `GET /api/v1/users/{id}`
pub async fn get<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(user_id): Path<UserId>,
) -> Result<Json<Envelope<UserView>>, ApiError> {
    if !caller.is_admin && caller.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    let user = state
        .store
        .get_user(&user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))?;
    Ok(envelope(&ctx, UserView::from(user)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateUserRequest {
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    global_roles: Option<BTreeSet<Role>>,
    #[serde(default)]
    password: Option<String>,
}

/// `PATCH /api/v1/users/{id}`
///
/// Users are deactivated, never deleted.
pub async fn update<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(user_id): Path<UserId>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<Envelope<UserView>>, ApiError> {
    require_admin(&caller)?;

    let mut user = state
        .store
        .get_user(&user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))?;

    if let Some(active) = request.active {
        user.active = active;
        if !active {
            // Deactivation also invalidates outstanding tokens.
            user.unique_token = uuid::Uuid::new_v4().to_string();
        }
    }
    if let Some(roles) = request.global_roles {
        user.global_roles = roles;
    }
    if let Some(password) = request.password {
        if password.len() < 8 {
            return Err(ApiError::BadRequest("password too short".into()));
        }
        user.password_hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    state
        .store
        .put_user(&user)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "user.update",
        "user",
        &user.email,
        "success",
        serde_json::Value::Null,
        &ctx.request_id,
    );

    Ok(envelope(&ctx, UserView::from(user)))
}
