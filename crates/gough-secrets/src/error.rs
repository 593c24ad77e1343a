//! Error types for secrets backends.

use thiserror::Error;

/// A result type using `SecretsError`.
pub type Result<T> = std::result::Result<T, SecretsError>;

/// Errors surfaced by secrets backends.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// No secret exists at the given path.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// The backend configuration is incomplete or invalid.
    #[error("secrets configuration error: {0}")]
    Config(String),

    /// No backend is registered under the requested name.
    #[error("unknown secrets backend: {0}")]
    UnknownBackend(String),

    /// The stored ciphertext could not be decrypted.
    ///
    /// Usually means `ENCRYPTION_KEY` changed since the value was written.
    #[error("decryption failed for {0}")]
    Decrypt(String),

    /// The stored value is not a JSON object.
    #[error("malformed secret at {0}: {1}")]
    Malformed(String, String),

    /// The local database rejected an operation.
    #[error("secrets database error: {0}")]
    Database(String),

    /// A remote backend call failed.
    #[error("secrets backend request failed: {0}")]
    Backend(String),
}
