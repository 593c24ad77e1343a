//! Team, membership, and resource assignment management.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use gough_core::{TeamId, UserId};
use gough_store::{ResourceAssignment, Store, Team, TeamMembership, TeamRole};

use crate::auth::{AuthUser, RequestContext};
use crate::error::ApiError;
use crate::handlers::{envelope, Envelope};
use crate::state::GatewayState;

fn team_admin_or_global<S: Store>(
    state: &GatewayState<S>,
    caller: &AuthUser,
    team_id: &TeamId,
) -> Result<(), ApiError> {
    if caller.is_admin {
        return Ok(());
    }
    let membership = state
        .store
        .get_membership(team_id, &caller.user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match membership {
        Some(m) if matches!(m.role, TeamRole::Owner | TeamRole::Admin) => Ok(()),
        _ => Err(ApiError::Forbidden),
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TeamView {
    id: TeamId,
    name: String,
    description: String,
    active: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct TeamList {
    teams: Vec<TeamView>,
}

/// `GET /api/v1/teams`: admins see all teams, others their own.
pub async fn list<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
) -> Result<Json<Envelope<TeamList>>, ApiError> {
    let teams = if caller.is_admin {
        state
            .store
            .list_teams()
            .map_err(|e| ApiError::Internal(e.to_string()))?
    } else {
        let memberships = state
            .store
            .list_memberships_by_user(&caller.user_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let mut teams = Vec::with_capacity(memberships.len());
        for membership in memberships {
            if let Some(team) = state
                .store
                .get_team(&membership.team_id)
                .map_err(|e| ApiError::Internal(e.to_string()))?
            {
                teams.push(team);
            }
        }
        teams
    };

    let teams = teams
        .into_iter()
        .map(|t| TeamView {
            id: t.id,
            name: t.name,
            description: t.description,
            active: t.active,
        })
        .collect();
    Ok(envelope(&ctx, TeamList { teams }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateTeamRequest {
    name: String,
    #[serde(default)]
    description: String,
}

/// `POST /api/v1/teams`: the creator becomes the team's owner.
pub async fn create<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Json(request): Json<CreateTeamRequest>,
) -> Result<(StatusCode, Json<Envelope<TeamView>>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("team name is required".into()));
    }

    let team = Team {
        id: TeamId::generate(),
        name: request.name,
        description: request.description,
        created_by: caller.user_id,
        active: true,
        created_at: Utc::now(),
    };
    state
        .store
        .put_team(&team)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .store
        .put_membership(&TeamMembership {
            team_id: team.id,
            user_id: caller.user_id,
            role: TeamRole::Owner,
            created_at: Utc::now(),
        })
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "team.create",
        "team",
        &team.name,
        "success",
        serde_json::Value::Null,
        &ctx.request_id,
    );

    Ok((
        StatusCode::CREATED,
        envelope(
            &ctx,
            TeamView {
                id: team.id,
                name: team.name,
                description: team.description,
                active: team.active,
            },
        ),
    ))
}

#[derive(Debug, Serialize)]
pub(crate) struct MemberView {
    user_id: UserId,
    role: TeamRole,
}

#[derive(Debug, Serialize)]
pub(crate) struct MemberList {
    members: Vec<MemberView>,
}

/// `GET /api/v1/teams/{id}/members`
pub async fn list_members<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(team_id): Path<TeamId>,
) -> Result<Json<Envelope<MemberList>>, ApiError> {
    if !caller.is_admin {
        state
            .store
            .get_membership(&team_id, &caller.user_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or(ApiError::Forbidden)?;
    }

    let members = state
        .store
        .list_memberships_by_team(&team_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .into_iter()
        .map(|m| MemberView {
            user_id: m.user_id,
            role: m.role,
        })
        .collect();
    Ok(envelope(&ctx, MemberList { members }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutMemberRequest {
    user_id: UserId,
    role: TeamRole,
}

/// `PUT /api/v1/teams/{id}/members`
pub async fn put_member<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(team_id): Path<TeamId>,
    Json(request): Json<PutMemberRequest>,
) -> Result<Json<Envelope<MemberView>>, ApiError> {
    team_admin_or_global(&state, &caller, &team_id)?;

    state
        .store
        .get_user(&request.user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", request.user_id)))?;

    // Demoting the last owner would orphan the team.
    if request.role != TeamRole::Owner {
        let is_demotion = state
            .store
            .get_membership(&team_id, &request.user_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .is_some_and(|m| m.role == TeamRole::Owner);
        if is_demotion && count_owners(&state, &team_id)? <= 1 {
            return Err(ApiError::Conflict("team must keep at least one owner".into()));
        }
    }

    state
        .store
        .put_membership(&TeamMembership {
            team_id,
            user_id: request.user_id,
            role: request.role,
            created_at: Utc::now(),
        })
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "team.member.put",
        "team",
        &team_id.to_string(),
        "success",
        serde_json::json!({"member": request.user_id, "role": request.role}),
        &ctx.request_id,
    );

    Ok(envelope(
        &ctx,
        MemberView {
            user_id: request.user_id,
            role: request.role,
        },
    ))
}

/// `DELETE /api/v1/teams/{id}/members/{user_id}`
pub async fn delete_member<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path((team_id, user_id)): Path<(TeamId, UserId)>,
) -> Result<Json<Envelope<MemberList>>, ApiError> {
    team_admin_or_global(&state, &caller, &team_id)?;

    let membership = state
        .store
        .get_membership(&team_id, &user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("membership".into()))?;

    if membership.role == TeamRole::Owner && count_owners(&state, &team_id)? <= 1 {
        return Err(ApiError::Conflict("team must keep at least one owner".into()));
    }

    state
        .store
        .delete_membership(&team_id, &user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    list_members(State(state), ctx, caller, Path(team_id)).await
}

fn count_owners<S: Store>(state: &GatewayState<S>, team_id: &TeamId) -> Result<usize, ApiError> {
    Ok(state
        .store
        .list_memberships_by_team(team_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .iter()
        .filter(|m| m.role == TeamRole::Owner)
        .count())
}

#[derive(Debug, Deserialize)]
pub(crate) struct PutAssignmentRequest {
    resource_type: String,
    resource_id: String,
    permissions: BTreeSet<String>,
    #[serde(default)]
    shell_principals: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AssignmentView {
    resource_type: String,
    resource_id: String,
    permissions: BTreeSet<String>,
    shell_principals: Vec<String>,
}

/// `PUT /api/v1/teams/{id}/assignments`
pub async fn put_assignment<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(team_id): Path<TeamId>,
    Json(request): Json<PutAssignmentRequest>,
) -> Result<Json<Envelope<AssignmentView>>, ApiError> {
    team_admin_or_global(&state, &caller, &team_id)?;

    if request.resource_type.contains('\0') || request.resource_id.contains('\0') {
        return Err(ApiError::BadRequest("invalid resource identifier".into()));
    }

    let assignment = ResourceAssignment {
        team_id,
        resource_type: request.resource_type.clone(),
        resource_id: request.resource_id.clone(),
        permissions: request.permissions.clone(),
        shell_principals: request.shell_principals.clone(),
        created_at: Utc::now(),
    };
    state
        .store
        .put_assignment(&assignment)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.auditor.record(
        &format!("user:{}", caller.user_id),
        "team.assignment.put",
        &request.resource_type,
        &request.resource_id,
        "success",
        serde_json::json!({"team_id": team_id, "permissions": request.permissions}),
        &ctx.request_id,
    );

    Ok(envelope(
        &ctx,
        AssignmentView {
            resource_type: request.resource_type,
            resource_id: request.resource_id,
            permissions: request.permissions,
            shell_principals: request.shell_principals,
        },
    ))
}

#[derive(Debug, Serialize)]
pub(crate) struct AssignmentList {
    assignments: Vec<AssignmentView>,
}

/// `GET /api/v1/teams/{id}/assignments`
pub async fn list_assignments<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: AuthUser,
    Path(team_id): Path<TeamId>,
) -> Result<Json<Envelope<AssignmentList>>, ApiError> {
    if !caller.is_admin {
        state
            .store
            .get_membership(&team_id, &caller.user_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .ok_or(ApiError::Forbidden)?;
    }

    let assignments = state
        .store
        .list_assignments_by_team(&team_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .into_iter()
        .map(|a| AssignmentView {
            resource_type: a.resource_type,
            resource_id: a.resource_id,
            permissions: a.permissions,
            shell_principals: a.shell_principals,
        })
        .collect();
    Ok(envelope(&ctx, AssignmentList { assignments }))
}
