//! Cloud provider registry endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use gough_core::ProviderId;
use gough_store::{CloudProvider, ProviderKind, Store};

use crate::auth::{AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

fn require_maintainer(user: &AuthUser) -> Result<(), ApiError> {
    if user.is_maintainer {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ProviderView {
    id: ProviderId,
    name: String,
    #[serde(rename = "type")]
    kind: ProviderKind,
    region: String,
    active: bool,
    last_sync_at: Option<chrono::DateTime<Utc>>,
}

impl From<CloudProvider> for ProviderView {
    fn from(provider: CloudProvider) -> Self {
        Self {
            id: provider.id,
            name: provider.name,
            kind: provider.kind,
            region: provider.region,
            active: provider.active,
            last_sync_at: provider.last_sync_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ProviderList {
    providers: Vec<ProviderView>,
}

/// `GET /api/v1/clouds/providers`
pub async fn list<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
) -> Result<Json<Envelope<ProviderList>>, ApiError> {
    require_maintainer(&caller)?;
    let providers = state
        .store
        .list_providers()
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .into_iter()
        .map(ProviderView::from)
        .collect();
    Ok(envelope(&ctx, ProviderList { providers }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateProviderRequest {
    name: String,
    #[serde(rename = "type")]
    kind: ProviderKind,
    #[serde(default)]
    region: String,
    /// Credential fields; written to the secrets store, never persisted in
    /// the provider row.
    credentials: gough_secrets::SecretMap,
    /// Optional shared secret for inbound webhooks.
    #[serde(default)]
    webhook_secret: Option<String>,
}

/// `POST /api/v1/clouds/providers`
pub async fn create<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Json(request): Json<CreateProviderRequest>,
) -> Result<(StatusCode, Json<Envelope<ProviderView>>), ApiError> {
    require_maintainer(&caller)?;

    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("provider name is required".into()));
    }
    let duplicate = state
        .store
        .list_providers()
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .iter()
        .any(|p| p.name == request.name);
    if duplicate {
        return Err(ApiError::Conflict(format!(
            "provider {} already exists",
            request.name
        )));
    }

    let id = ProviderId::generate();
    let credentials_ref = format!("cloud/{}/{id}", request.kind.as_str());
    state
        .secrets
        .set(&credentials_ref, request.credentials)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let webhook_secret_ref = if let Some(secret) = request.webhook_secret {
        let path = format!("cloud/{}/{id}/webhook", request.kind.as_str());
        let mut map = gough_secrets::SecretMap::new();
        map.insert("secret".into(), serde_json::Value::String(secret));
        state
            .secrets
            .set(&path, map)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Some(path)
    } else {
        None
    };

    let provider = CloudProvider {
        id,
        name: request.name,
        kind: request.kind,
        region: request.region,
        credentials_ref,
        webhook_secret_ref,
        active: true,
        last_sync_at: None,
        created_at: Utc::now(),
    };
    state
        .store
        .put_provider(&provider)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "provider.create",
        "provider",
        &provider.name,
        "success",
        serde_json::json!({"type": provider.kind.as_str(), "region": provider.region}),
        &ctx.request_id,
    );

    Ok((
        StatusCode::CREATED,
        envelope(&ctx, ProviderView::from(provider)),
    ))
}

/// `GET /api/v1/clouds/providers/{id}`
pub async fn get<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(provider_id): Path<ProviderId>,
) -> Result<Json<Envelope<ProviderView>>, ApiError> {
    require_maintainer(&caller)?;
    let provider = state
        .store
        .get_provider(&provider_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("provider {provider_id}")))?;
    Ok(envelope(&ctx, ProviderView::from(provider)))
}
