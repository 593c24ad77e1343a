//! Machine listing, creation, and lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use gough_clouds::{MachineFilters, MachineSpec};
use gough_control::orchestrator::LifecycleOp;
use gough_core::{Capability, MachineState, ProviderId};
use gough_store::{MachineRecord, Store};

use crate::auth::{AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

#[derive(Debug, Serialize)]
pub(crate) struct MachineView {
    /// Composite id usable in machine lifecycle paths.
    id: String,
    provider_id: ProviderId,
    external_id: String,
    hostname: String,
    state: MachineState,
    public_ips: Vec<String>,
    private_ips: Vec<String>,
    size: String,
    image: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<MachineRecord> for MachineView {
    fn from(record: MachineRecord) -> Self {
        Self {
            id: format!("{}:{}", record.provider_id, record.external_id),
            provider_id: record.provider_id,
            external_id: record.external_id,
            hostname: record.hostname,
            state: record.state,
            public_ips: record.public_ips,
            private_ips: record.private_ips,
            size: record.size,
            image: record.image,
            updated_at: record.updated_at,
        }
    }
}

/// Parse the composite `{provider_id}:{external_id}` machine id.
fn parse_machine_id(id: &str) -> Result<(ProviderId, String), ApiError> {
    let (provider, external) = id
        .split_once(':')
        .ok_or_else(|| ApiError::BadRequest("machine id must be provider:external".into()))?;
    let provider_id = provider
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid provider id".into()))?;
    Ok((provider_id, external.to_string()))
}

/// Write access to a machine: global maintainer, or an explicit `write`
/// grant on the machine resource.
fn authorize_write<S: Store>(
    state: &GatewayState<S>,
    caller: &AuthUser,
    external_id: &str,
) -> Result<(), ApiError> {
    if caller.is_maintainer {
        return Ok(());
    }
    let caps = state
        .permissions
        .evaluate(&caller.user_id, "machine", external_id);
    if caps.contains(Capability::Write) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MachineList {
    machines: Vec<MachineView>,
}

/// `GET /api/v1/clouds/providers/{id}/machines`
pub async fn list<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(provider_id): Path<ProviderId>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<MachineList>>, ApiError> {
    if !caller.is_maintainer {
        // Non-maintainers see the cache only; reads do not hit providers.
        let machines = state
            .store
            .list_machines_by_provider(&provider_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .into_iter()
            .filter(|m| {
                state
                    .permissions
                    .evaluate(&caller.user_id, "machine", &m.external_id)
                    .contains(Capability::Read)
            })
            .map(MachineView::from)
            .collect();
        return Ok(envelope(&ctx, MachineList { machines }));
    }

    let filters = MachineFilters {
        name: query.name,
        ..MachineFilters::default()
    };
    let machines = state
        .orchestrator
        .list_machines(&provider_id, &filters)
        .await?
        .into_iter()
        .map(MachineView::from)
        .collect();
    Ok(envelope(&ctx, MachineList { machines }))
}

/// `POST /api/v1/clouds/providers/{id}/machines`
pub async fn create<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(provider_id): Path<ProviderId>,
    Json(spec): Json<MachineSpec>,
) -> Result<(StatusCode, Json<Envelope<MachineView>>), ApiError> {
    if !caller.is_maintainer {
        return Err(ApiError::Forbidden);
    }
    if spec.name.trim().is_empty() {
        return Err(ApiError::BadRequest("machine name is required".into()));
    }
    if spec.image.trim().is_empty() {
        return Err(ApiError::BadRequest("machine image is required".into()));
    }

    let record = state.orchestrator.create_machine(&provider_id, &spec).await?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "machine.create",
        "machine",
        &record.external_id,
        "success",
        serde_json::json!({"provider_id": provider_id, "name": spec.name}),
        &ctx.request_id,
    );

    // Transitional states return 202: the client polls until stable.
    let status = if record.state.is_transitional() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, envelope(&ctx, MachineView::from(record))))
}

/// `GET /api/v1/clouds/machines/{id}`
pub async fn get<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<MachineView>>, ApiError> {
    let (provider_id, external_id) = parse_machine_id(&id)?;
    if !caller.is_maintainer
        && !state
            .permissions
            .evaluate(&caller.user_id, "machine", &external_id)
            .contains(Capability::Read)
    {
        return Err(ApiError::Forbidden);
    }

    let record = state.orchestrator.get_machine(&provider_id, &external_id).await?;
    Ok(envelope(&ctx, MachineView::from(record)))
}

async fn lifecycle<S: Store + 'static>(
    state: &GatewayState<S>,
    ctx: &RequestContext,
    caller: &AuthUser,
    id: &str,
    op: LifecycleOp,
    action: &str,
) -> Result<MachineView, ApiError> {
    let (provider_id, external_id) = parse_machine_id(id)?;
    authorize_write(state, caller, &external_id)?;

    let record = state
        .orchestrator
        .lifecycle(&provider_id, &external_id, op)
        .await?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        action,
        "machine",
        &external_id,
        "success",
        serde_json::json!({"provider_id": provider_id}),
        &ctx.request_id,
    );

    Ok(MachineView::from(record))
}

/// `POST /api/v1/clouds/machines/{id}/start`
pub async fn start<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<MachineView>>, ApiError> {
    let view = lifecycle(&state, &ctx, &caller, &id, LifecycleOp::Start, "machine.start").await?;
    Ok(envelope(&ctx, view))
}

/// `POST /api/v1/clouds/machines/{id}/stop`
pub async fn stop<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<MachineView>>, ApiError> {
    let view = lifecycle(&state, &ctx, &caller, &id, LifecycleOp::Stop, "machine.stop").await?;
    Ok(envelope(&ctx, view))
}

/// `POST /api/v1/clouds/machines/{id}/reboot`
pub async fn reboot<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<MachineView>>, ApiError> {
    let view =
        lifecycle(&state, &ctx, &caller, &id, LifecycleOp::Reboot, "machine.reboot").await?;
    Ok(envelope(&ctx, view))
}

#[derive(Debug, Serialize)]
pub(crate) struct DestroyResponse {
    destroyed: bool,
}

/// `POST /api/v1/clouds/machines/{id}/destroy`
pub async fn destroy<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<DestroyResponse>>, ApiError> {
    let (provider_id, external_id) = parse_machine_id(&id)?;
    authorize_write(&state, &caller, &external_id)?;

    state
        .orchestrator
        .destroy_machine(&provider_id, &external_id)
        .await?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "machine.destroy",
        "machine",
        &external_id,
        "success",
        serde_json::json!({"provider_id": provider_id}),
        &ctx.request_id,
    );

    Ok(envelope(&ctx, DestroyResponse { destroyed: true }))
}

#[derive(Debug, Serialize)]
pub(crate) struct ConsoleResponse {
    output: String,
}

/// `GET /api/v1/clouds/machines/{id}/console`
pub async fn console<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Envelope<ConsoleResponse>>, ApiError> {
    let (provider_id, external_id) = parse_machine_id(&id)?;
    authorize_write(&state, &caller, &external_id)?;

    let output = state
        .orchestrator
        .console_output(&provider_id, &external_id)
        .await?;
    Ok(envelope(&ctx, ConsoleResponse { output }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_parse() {
        let provider = ProviderId::generate();
        let (parsed, external) = parse_machine_id(&format!("{provider}:i-0123")).unwrap();
        assert_eq!(parsed, provider);
        assert_eq!(external, "i-0123");

        assert!(parse_machine_id("no-separator").is_err());
        assert!(parse_machine_id("not-a-uuid:i-0123").is_err());
    }
}
