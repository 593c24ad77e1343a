//! Request handlers.

pub mod agents;
pub mod auth;
pub mod health;
pub mod machines;
pub mod providers;
pub mod shell;
pub mod teams;
pub mod users;
pub mod webhooks;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::RequestContext;

/// Standard response envelope: every JSON response carries a timestamp and
/// the request id alongside the payload fields.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    /// Response time.
    pub timestamp: DateTime<Utc>,
    /// The request id assigned by the gateway.
    pub request_id: String,
    /// Payload, flattened into the top-level object.
    #[serde(flatten)]
    pub data: T,
}

/// Wrap a payload in the standard envelope.
pub fn envelope<T: Serialize>(ctx: &RequestContext, data: T) -> axum::Json<Envelope<T>> {
    axum::Json(Envelope {
        timestamp: Utc::now(),
        request_id: ctx.request_id.clone(),
        data,
    })
}
