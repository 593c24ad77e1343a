//! The driver error taxonomy.
//!
//! Every driver surfaces exactly four error kinds. Anything a caller cannot
//! act on specifically collapses into [`CloudError::Cloud`], which carries
//! the underlying provider code and a timeout flag the orchestrator may use
//! for retries.

use thiserror::Error;

/// A result type using `CloudError`.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Errors surfaced by cloud drivers.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Authentication or authorization with the provider failed.
    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// The machine (or other object) does not exist at the provider.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider refused for capacity or quota reasons.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Any other provider failure.
    #[error("provider error: {message}")]
    Cloud {
        /// Human-readable message.
        message: String,
        /// Provider error code, when one was returned.
        code: Option<String>,
        /// True when the failure was a network or deadline timeout.
        timeout: bool,
    },
}

impl CloudError {
    /// A catch-all provider error with no code.
    #[must_use]
    pub fn cloud(message: impl Into<String>) -> Self {
        Self::Cloud {
            message: message.into(),
            code: None,
            timeout: false,
        }
    }

    /// A provider error flagged as a timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Cloud {
            message: message.into(),
            code: None,
            timeout: true,
        }
    }

    /// True when retrying after re-authentication may help.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// True when the error was a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Cloud { timeout: true, .. })
    }

    /// Map a non-success HTTP status from a REST provider into the taxonomy.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth(format!("{status}: {body}")),
            404 => Self::NotFound(body.to_string()),
            402 | 429 => Self::Quota(format!("{status}: {body}")),
            _ => Self::Cloud {
                message: body.to_string(),
                code: Some(status.as_u16().to_string()),
                timeout: false,
            },
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_connect() {
            Self::Cloud {
                message: err.to_string(),
                code: None,
                timeout: false,
            }
        } else {
            Self::cloud(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            CloudError::from_status(reqwest::StatusCode::UNAUTHORIZED, "bad key"),
            CloudError::Auth(_)
        ));
        assert!(matches!(
            CloudError::from_status(reqwest::StatusCode::NOT_FOUND, "gone"),
            CloudError::NotFound(_)
        ));
        assert!(matches!(
            CloudError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down"),
            CloudError::Quota(_)
        ));
        assert!(matches!(
            CloudError::from_status(reqwest::StatusCode::BAD_GATEWAY, "oops"),
            CloudError::Cloud { .. }
        ));
    }

    #[test]
    fn timeout_flag() {
        assert!(CloudError::timeout("deadline").is_timeout());
        assert!(!CloudError::cloud("other").is_timeout());
    }
}
