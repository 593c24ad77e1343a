//! Control plane error type.
//!
//! These variants correspond one-to-one with the error shapes the HTTP
//! facade surfaces to callers; the gateway maps them onto status codes.

use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors surfaced by control plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Bad credentials, expired token, or invalid enrollment key.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The permission evaluator returned insufficient capabilities.
    #[error("permission denied")]
    PermissionDenied,

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with current state (duplicate name, reused
    /// enrollment key, illegal state transition).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A provider or the rate limiter refused for capacity reasons.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// The request is malformed or violates a policy bound.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No active agent can serve the request.
    #[error("no agent available: {0}")]
    AgentUnavailable(String),

    /// An underlying cloud provider returned an opaque error.
    #[error("provider error: {0}")]
    Provider(#[from] gough_clouds::CloudError),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] gough_store::StoreError),

    /// The secrets backend failed.
    #[error("secrets error: {0}")]
    Secrets(#[from] gough_secrets::SecretsError),

    /// Everything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<gough_ca::CaError> for ControlError {
    fn from(err: gough_ca::CaError) -> Self {
        use gough_ca::CaError;
        match err {
            CaError::EmptyPrincipals
            | CaError::InvalidPrincipal(_)
            | CaError::ValidityTooLong { .. }
            | CaError::InvalidPublicKey(_) => Self::Validation(err.to_string()),
            CaError::NoActiveCa | CaError::MissingPrivateKey(_) => {
                Self::Internal(err.to_string())
            }
            CaError::Key(e) => Self::Internal(e.to_string()),
            CaError::Secrets(e) => Self::Secrets(e),
            CaError::Store(e) => Self::Store(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gough_ca::CaError;

    #[test]
    fn ca_policy_errors_become_validation() {
        let err: ControlError = CaError::EmptyPrincipals.into();
        assert!(matches!(err, ControlError::Validation(_)));

        let err: ControlError = CaError::ValidityTooLong {
            requested: 99_999,
            max: 28_800,
        }
        .into();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[test]
    fn missing_ca_key_is_internal() {
        let err: ControlError = CaError::MissingPrivateKey("ssh-ca/x".into()).into();
        assert!(matches!(err, ControlError::Internal(_)));
    }
}
