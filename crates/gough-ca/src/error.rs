//! Error types for the certificate authority.

use thiserror::Error;

/// A result type using `CaError`.
pub type Result<T> = std::result::Result<T, CaError>;

/// Errors surfaced by CA operations.
#[derive(Debug, Error)]
pub enum CaError {
    /// A requested principal is not in the CA's allowed set.
    #[error("principal not allowed: {0}")]
    InvalidPrincipal(String),

    /// No principals were requested.
    #[error("at least one principal is required")]
    EmptyPrincipals,

    /// The requested validity exceeds the CA's hard ceiling.
    #[error("validity {requested}s exceeds maximum {max}s")]
    ValidityTooLong {
        /// Requested validity in seconds.
        requested: u64,
        /// The CA's ceiling in seconds.
        max: u64,
    },

    /// The submitted public key could not be parsed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// No active user CA exists.
    #[error("no active user CA")]
    NoActiveCa,

    /// The CA private key is missing from the secrets store.
    ///
    /// This is fatal for the sign path; the CA must be re-initialized or the
    /// secrets backend repaired.
    #[error("CA private key not found at {0}")]
    MissingPrivateKey(String),

    /// Key generation or signing failed.
    #[error("ssh key operation failed: {0}")]
    Key(#[from] ssh_key::Error),

    /// The secrets backend failed.
    #[error(transparent)]
    Secrets(#[from] gough_secrets::SecretsError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] gough_store::StoreError),
}
