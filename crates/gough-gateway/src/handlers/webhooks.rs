//! Inbound provider webhooks.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use gough_control::webhooks::WebhookOutcome;
use gough_core::ProviderId;
use gough_store::{ProviderKind, Store};

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookQuery {
    /// Target provider; optional when exactly one active MaaS provider is
    /// registered.
    #[serde(default)]
    provider_id: Option<ProviderId>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WebhookResponse {
    accepted: bool,
    duplicate: bool,
}

/// `POST /webhooks/maas`
///
/// Authenticated by `X-MaaS-Signature` (HMAC-SHA256 over the raw body),
/// never by bearer tokens.
pub async fn maas<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Envelope<WebhookResponse>>, ApiError> {
    let signature = headers
        .get("x-maas-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-MaaS-Signature".into()))?;
    let event_type = headers
        .get("x-maas-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("machine.updated");

    let provider_id = match query.provider_id {
        Some(id) => id,
        None => {
            let mut maas_providers: Vec<ProviderId> = state
                .store
                .list_providers()
                .map_err(|e| ApiError::Internal(e.to_string()))?
                .into_iter()
                .filter(|p| p.active && p.kind == ProviderKind::Maas)
                .map(|p| p.id)
                .collect();
            match (maas_providers.pop(), maas_providers.is_empty()) {
                (Some(id), true) => id,
                (Some(_), false) => {
                    return Err(ApiError::BadRequest(
                        "multiple MaaS providers; provider_id query parameter required".into(),
                    ));
                }
                (None, _) => {
                    return Err(ApiError::NotFound("no active MaaS provider".into()));
                }
            }
        }
    };

    let outcome = state
        .webhooks
        .process_maas(&provider_id, &body, signature, event_type)
        .await?;

    Ok(envelope(
        &ctx,
        WebhookResponse {
            accepted: true,
            duplicate: outcome == WebhookOutcome::Duplicate,
        },
    ))
}
