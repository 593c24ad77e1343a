//! API error types and responses.
//!
//! Every error response has the shape
//! `{"error": {"code", "message"}, "timestamp", "request_id"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use gough_control::ControlError;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid authentication.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller lacks the required capability.
    #[error("forbidden")]
    Forbidden,

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A provider quota or the rate limiter refused.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An underlying cloud provider failed opaquely.
    #[error("provider error: {0}")]
    Provider(String),

    /// No agent can serve the request right now.
    #[error("agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Internal server error; details stay in the logs.
    #[error("internal error")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
    timestamp: chrono::DateTime<chrono::Utc>,
    request_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// The HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Quota(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The stable error code string.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "auth_error",
            Self::Forbidden => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Quota(_) => "quota_error",
            Self::BadRequest(_) => "validation_error",
            Self::Provider(_) => "provider_error",
            Self::AgentUnavailable(_) => "agent_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Render with the request id the middleware assigned.
    #[must_use]
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = match &self {
            // Internal details are logged, not surfaced.
            Self::Internal(detail) => {
                tracing::error!(request_id, detail, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: ErrorBody { code, message },
            timestamp: chrono::Utc::now(),
            request_id: request_id.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with_id("-")
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Auth(msg) => Self::Unauthorized(msg),
            ControlError::PermissionDenied => Self::Forbidden,
            ControlError::NotFound(what) => Self::NotFound(what),
            ControlError::Conflict(what) => Self::Conflict(what),
            ControlError::Quota(what) => Self::Quota(what),
            ControlError::Validation(what) => Self::BadRequest(what),
            ControlError::AgentUnavailable(what) => Self::AgentUnavailable(what),
            ControlError::Provider(e) => match e {
                gough_clouds::CloudError::Auth(msg) => Self::Provider(format!("auth: {msg}")),
                gough_clouds::CloudError::NotFound(what) => Self::NotFound(what),
                gough_clouds::CloudError::Quota(what) => Self::Quota(what),
                gough_clouds::CloudError::Cloud { message, .. } => Self::Provider(message),
            },
            ControlError::Store(e) => Self::Internal(e.to_string()),
            ControlError::Secrets(e) => Self::Internal(e.to_string()),
            ControlError::Internal(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::Quota("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Provider("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn control_errors_map() {
        let err: ApiError = ControlError::PermissionDenied.into();
        assert!(matches!(err, ApiError::Forbidden));

        let err: ApiError =
            ControlError::Provider(gough_clouds::CloudError::Quota("full".into())).into();
        assert!(matches!(err, ApiError::Quota(_)));

        let err: ApiError =
            ControlError::Provider(gough_clouds::CloudError::cloud("boom")).into();
        assert!(matches!(err, ApiError::Provider(_)));
    }
}
