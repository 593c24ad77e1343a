//! Certificate validation against the cached CA public key.
//!
//! The agent trusts exactly the CA keys it cached at enrollment (`ca.pub`;
//! several lines after a CA rotation). A presented certificate is accepted
//! when its validity window is open, its signing key matches a trusted CA,
//! and the connecting username appears in its principals.

use chrono::Utc;
use ssh_key::{Certificate, Fingerprint, HashAlg, PublicKey};
use thiserror::Error;

/// Advisory extension name carrying the brokered session id.
pub const SESSION_ID_EXTENSION: &str = "session-id@gough.dev";

/// Why a certificate was rejected.
#[derive(Debug, Error)]
pub enum CertError {
    /// The validity window has not opened yet.
    #[error("certificate not yet valid")]
    NotYetValid,

    /// The validity window has closed.
    #[error("certificate expired")]
    Expired,

    /// The signing CA is not one the agent trusts.
    #[error("certificate is not signed by a trusted CA")]
    UntrustedCa,

    /// The connecting username is not in the principals.
    #[error("username {0} is not a certificate principal")]
    PrincipalMismatch(String),

    /// Not a user certificate.
    #[error("not a user certificate")]
    WrongType,

    /// The certificate could not be verified structurally.
    #[error("certificate verification failed: {0}")]
    Invalid(String),
}

/// Accepted certificate details.
#[derive(Debug, Clone)]
pub struct AcceptedCert {
    /// Certificate key id, for logs and audit correlation.
    pub key_id: String,
    /// Certificate serial.
    pub serial: u64,
    /// The principal the connection authenticated as.
    pub principal: String,
    /// The brokered session id, when the control plane embedded one.
    pub session_id: Option<gough_core::SessionId>,
    /// Seconds until the certificate expires.
    pub remaining_s: u64,
}

/// Validator over the cached CA public keys.
pub struct CertChecker {
    fingerprints: Vec<Fingerprint>,
}

impl CertChecker {
    /// Build a checker from the contents of `ca.pub` (one OpenSSH public
    /// key per line).
    ///
    /// # Errors
    ///
    /// Returns an error when no line parses as a public key.
    pub fn from_ca_file(contents: &str) -> anyhow::Result<Self> {
        let mut fingerprints = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key = PublicKey::from_openssh(line)?;
            fingerprints.push(key.fingerprint(HashAlg::Sha256));
        }
        anyhow::ensure!(!fingerprints.is_empty(), "no CA public keys found");
        Ok(Self { fingerprints })
    }

    /// Validate a certificate for a connecting username.
    ///
    /// # Errors
    ///
    /// Returns the specific [`CertError`] for the first failed check; the
    /// SSH server maps every variant to an auth failure.
    pub fn check(&self, certificate: &Certificate, username: &str) -> Result<AcceptedCert, CertError> {
        if certificate.cert_type() != ssh_key::certificate::CertType::User {
            return Err(CertError::WrongType);
        }

        #[allow(clippy::cast_sign_loss)]
        let now = Utc::now().timestamp() as u64;
        if now < certificate.valid_after() {
            return Err(CertError::NotYetValid);
        }
        if now >= certificate.valid_before() {
            return Err(CertError::Expired);
        }

        // Signature and CA trust in one step.
        certificate
            .validate_at(now, self.fingerprints.iter())
            .map_err(|e| {
                if self.signed_by_trusted_ca(certificate) {
                    CertError::Invalid(e.to_string())
                } else {
                    CertError::UntrustedCa
                }
            })?;

        if !certificate.valid_principals().iter().any(|p| p == username) {
            return Err(CertError::PrincipalMismatch(username.to_string()));
        }

        let session_id = certificate
            .extensions()
            .get(SESSION_ID_EXTENSION)
            .and_then(|v| v.parse().ok());

        Ok(AcceptedCert {
            key_id: certificate.key_id().to_string(),
            serial: certificate.serial(),
            principal: username.to_string(),
            session_id,
            remaining_s: certificate.valid_before().saturating_sub(now),
        })
    }

    fn signed_by_trusted_ca(&self, certificate: &Certificate) -> bool {
        let ca = certificate.signature_key().fingerprint(HashAlg::Sha256);
        self.fingerprints.contains(&ca)
    }
}
