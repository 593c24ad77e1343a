//! Router configuration.
//!
//! Route table per the external interface contract:
//!
//! ## Public
//! - `GET /healthz`, `GET /readyz`, `GET /metrics`
//! - `POST /api/v1/auth/login`
//! - `POST /webhooks/maas` (HMAC-authenticated)
//!
//! ## Users (bearer access token)
//! - `POST /api/v1/auth/refresh`, `POST /api/v1/auth/logout`
//! - `/api/v1/users` CRUD (admin)
//! - `/api/v1/teams` + members + assignments
//! - `/api/v1/clouds/providers` registry and machines
//! - `/api/v1/clouds/machines/{id}/{start,stop,reboot,destroy,console}`
//! - `POST /api/v1/shell/sessions`, `DELETE /api/v1/shell/sessions/{id}`
//! - `GET /ws/shell?session_id=…&token=…`
//!
//! ## Agents
//! - `POST /api/v1/enrollment-keys` (admin mints)
//! - `POST /api/v1/agents/enroll` (`X-Enrollment-Key`)
//! - `POST /api/v1/agents/refresh`, `POST /api/v1/agents/heartbeat`

use std::sync::Arc;

use axum::extract::State;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use gough_store::Store;

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::handlers::{agents, auth, health, machines, providers, shell, teams, users, webhooks};
use crate::ratelimit::RateDecision;
use crate::state::GatewayState;
use crate::ws;

/// Create the gateway router with all routes and middleware.
pub fn create_router<S: Store + 'static>(state: GatewayState<S>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();

    let state = Arc::new(state);

    Router::new()
        // Health and metrics (public)
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz::<S>))
        .route("/metrics", get(health::metrics::<S>))
        // Auth
        .route("/api/v1/auth/login", post(auth::login::<S>))
        .route("/api/v1/auth/refresh", post(auth::refresh::<S>))
        .route("/api/v1/auth/logout", post(auth::logout::<S>))
        // Users
        .route(
            "/api/v1/users",
            get(users::list::<S>).post(users::create::<S>),
        )
        .route(
            "/api/v1/users/{id}",
            get(users::get::<S>).patch(users::update::<S>),
        )
        // Teams
        .route(
            "/api/v1/teams",
            get(teams::list::<S>).post(teams::create::<S>),
        )
        .route(
            "/api/v1/teams/{id}/members",
            get(teams::list_members::<S>).put(teams::put_member::<S>),
        )
        .route(
            "/api/v1/teams/{id}/members/{user_id}",
            delete(teams::delete_member::<S>),
        )
        .route(
            "/api/v1/teams/{id}/assignments",
            get(teams::list_assignments::<S>).put(teams::put_assignment::<S>),
        )
        // Cloud providers and machines
        .route(
            "/api/v1/clouds/providers",
            get(providers::list::<S>).post(providers::create::<S>),
        )
        .route("/api/v1/clouds/providers/{id}", get(providers::get::<S>))
        .route(
            "/api/v1/clouds/providers/{id}/machines",
            get(machines::list::<S>).post(machines::create::<S>),
        )
        .route("/api/v1/clouds/machines/{id}", get(machines::get::<S>))
        .route("/api/v1/clouds/machines/{id}/start", post(machines::start::<S>))
        .route("/api/v1/clouds/machines/{id}/stop", post(machines::stop::<S>))
        .route(
            "/api/v1/clouds/machines/{id}/reboot",
            post(machines::reboot::<S>),
        )
        .route(
            "/api/v1/clouds/machines/{id}/destroy",
            post(machines::destroy::<S>),
        )
        .route(
            "/api/v1/clouds/machines/{id}/console",
            get(machines::console::<S>),
        )
        // SSH CA (admin debug; the broker signs internally)
        .route("/api/v1/ssh-ca/sign", post(sign_debug::<S>))
        // Agents
        .route(
            "/api/v1/enrollment-keys",
            post(agents::mint_enrollment_key::<S>),
        )
        .route("/api/v1/agents", get(agents::list::<S>))
        .route("/api/v1/agents/enroll", post(agents::enroll::<S>))
        .route("/api/v1/agents/refresh", post(agents::refresh::<S>))
        .route("/api/v1/agents/heartbeat", post(agents::heartbeat::<S>))
        .route("/api/v1/agents/{id}/status", post(agents::set_status::<S>))
        // Shell sessions
        .route("/api/v1/shell/sessions", post(shell::open::<S>))
        .route("/api/v1/shell/sessions/{id}", delete(shell::terminate::<S>))
        // Browser terminal
        .route("/ws/shell", get(ws::shell_ws::<S>))
        // Webhooks
        .route("/webhooks/maas", post(webhooks::maas::<S>))
        // Middleware
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware::<S>,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Per-IP rate limiting applied to every route.
async fn rate_limit_middleware<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.ratelimit.check(&ctx.client_ip).await == RateDecision::Limited {
        state
            .metrics
            .http_requests
            .with_label_values(&["rate_limited", "429"])
            .inc();
        return ApiError::Quota("rate limit exceeded".into())
            .into_response_with_id(&ctx.request_id);
    }

    let response = next.run(request).await;
    state
        .metrics
        .http_requests
        .with_label_values(&["api", response.status().as_str()])
        .inc();
    response
}

/// `POST /api/v1/ssh-ca/sign`: direct signing for admin debugging; the
/// broker is the production signer.
async fn sign_debug<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
    ctx: RequestContext,
    caller: crate::auth::AuthUser,
    axum::Json(request): axum::Json<SignDebugRequest>,
) -> Result<axum::Json<crate::handlers::Envelope<SignDebugResponse>>, ApiError> {
    if !caller.is_admin {
        return Err(ApiError::Forbidden);
    }

    let key_id = gough_ca::generate_key_id(&caller.email, "debug", chrono::Utc::now());
    let certificate = state
        .ca
        .sign(
            &request.public_key,
            &request.principals,
            request.validity_s,
            &key_id,
        )
        .await
        .map_err(gough_control::ControlError::from)?;

    Ok(crate::handlers::envelope(
        &ctx,
        SignDebugResponse { certificate },
    ))
}

#[derive(Debug, serde::Deserialize)]
struct SignDebugRequest {
    public_key: String,
    principals: Vec<String>,
    validity_s: u64,
}

#[derive(Debug, serde::Serialize)]
struct SignDebugResponse {
    certificate: String,
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_any_origin() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn cors_specific_origins() {
        let origins = vec![
            "http://localhost:3000".to_string(),
            "https://console.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }
}
