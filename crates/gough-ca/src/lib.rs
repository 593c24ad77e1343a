//! SSH certificate authority.
//!
//! Generates and holds custody of the CA keypair, and signs user public keys
//! into short-lived OpenSSH certificates. The private key lives only in the
//! secrets store under `ssh-ca/<name>/private_key`; the public half and the
//! signing policy (allowed principals, validity ceiling, serial counter)
//! live in the relational store.
//!
//! Certificates follow standard OpenSSH semantics
//! (`ssh-rsa-cert-v01@openssh.com`): agents cache the CA public key at
//! enrollment and accept any unexpired certificate chaining to it whose
//! principals contain the connecting username.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ssh_key::certificate::{Builder as CertBuilder, CertType};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::rand_core::OsRng;
use ssh_key::{LineEnding, PrivateKey, PublicKey};

use gough_secrets::{SecretMap, SecretsBackend};
use gough_store::{CaKind, SshCaConfig, Store};

pub use error::{CaError, Result};

/// Default certificate validity: one hour.
pub const DEFAULT_VALIDITY_SECONDS: u64 = 3600;

/// Hard ceiling on certificate validity: eight hours.
pub const MAX_VALIDITY_SECONDS: u64 = 28_800;

/// CA key size in bits.
pub const CA_KEY_SIZE: usize = 4096;

const PRIVATE_KEY_FIELD: &str = "private_key_pem";

/// Advisory certificate extension carrying the brokered session id.
///
/// Unknown extensions are ignored by standard OpenSSH validators, so
/// certificates remain usable with stock sshd; gough agents read it to
/// attribute PTY sessions.
pub const SESSION_ID_EXTENSION: &str = "session-id@gough.dev";

/// The permit-* extensions a standard user certificate carries.
const STANDARD_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// The SSH certificate authority.
pub struct CertificateAuthority<S: Store> {
    store: Arc<S>,
    secrets: Arc<dyn SecretsBackend>,
}

impl<S: Store> CertificateAuthority<S> {
    /// Create a CA handle over the given store and secrets backend.
    #[must_use]
    pub fn new(store: Arc<S>, secrets: Arc<dyn SecretsBackend>) -> Self {
        Self { store, secrets }
    }

    /// Initialize a new user CA if none is active, returning the active CA.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation, the secrets write, or the store
    /// write fails.
    pub async fn ensure_initialized(
        &self,
        name: &str,
        allowed_principals: Vec<String>,
    ) -> Result<SshCaConfig> {
        if let Some(ca) = self.store.active_user_ca()? {
            return Ok(ca);
        }
        tracing::info!(name, "no active user CA, initializing");
        self.initialize(name, allowed_principals, CA_KEY_SIZE).await
    }

    /// Generate a fresh RSA CA keypair and activate it.
    ///
    /// Any previously active user CA is retained inactive so agents holding
    /// both public keys keep accepting unexpired certificates.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation, the secrets write, or the store
    /// write fails.
    pub async fn initialize(
        &self,
        name: &str,
        allowed_principals: Vec<String>,
        key_size: usize,
    ) -> Result<SshCaConfig> {
        tracing::info!(name, key_size, "generating SSH CA keypair");

        let keypair = RsaKeypair::random(&mut OsRng, key_size)?;
        let private_key = PrivateKey::new(KeypairData::Rsa(keypair), format!("gough-ca-{name}"))?;
        let public_key = private_key.public_key().to_openssh()?;
        let private_pem = private_key.to_openssh(LineEnding::LF)?;

        let private_key_ref = format!("ssh-ca/{name}/private_key");
        let mut secret = SecretMap::new();
        secret.insert(
            PRIVATE_KEY_FIELD.to_string(),
            serde_json::Value::String(private_pem.to_string()),
        );
        self.secrets.set(&private_key_ref, secret).await?;

        let ca = SshCaConfig {
            name: name.to_string(),
            kind: CaKind::User,
            public_key,
            private_key_ref,
            default_validity_s: DEFAULT_VALIDITY_SECONDS,
            max_validity_s: MAX_VALIDITY_SECONDS,
            allowed_principals,
            serial: 0,
            active: true,
            created_at: Utc::now(),
        };
        self.store.put_ca_config(&ca)?;

        tracing::info!(name, "SSH CA initialized");
        Ok(ca)
    }

    /// The active user CA's public key in OpenSSH format.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::NoActiveCa`] if no user CA is active.
    pub fn public_key(&self) -> Result<String> {
        Ok(self.active_ca()?.public_key)
    }

    /// The active user CA row.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::NoActiveCa`] if no user CA is active.
    pub fn active_ca(&self) -> Result<SshCaConfig> {
        self.store.active_user_ca()?.ok_or(CaError::NoActiveCa)
    }

    /// Sign a user public key into an OpenSSH certificate.
    ///
    /// `principals` must be a non-empty subset of the CA's allowed
    /// principals, and `validity_s` may not exceed the CA ceiling. The CA
    /// serial is durably incremented before the certificate is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::EmptyPrincipals`], [`CaError::InvalidPrincipal`],
    /// or [`CaError::ValidityTooLong`] on policy violations;
    /// [`CaError::MissingPrivateKey`] when the secrets store no longer holds
    /// the key material.
    pub async fn sign(
        &self,
        public_key: &str,
        principals: &[String],
        validity_s: u64,
        key_id: &str,
    ) -> Result<String> {
        self.sign_session(public_key, principals, validity_s, key_id, None)
            .await
    }

    /// Sign a user public key, embedding the brokered session id as an
    /// advisory extension so agents can attribute the connection.
    ///
    /// # Errors
    ///
    /// As [`CertificateAuthority::sign`].
    pub async fn sign_session(
        &self,
        public_key: &str,
        principals: &[String],
        validity_s: u64,
        key_id: &str,
        session_id: Option<&str>,
    ) -> Result<String> {
        let ca = self.active_ca()?;

        if principals.is_empty() {
            return Err(CaError::EmptyPrincipals);
        }
        for principal in principals {
            if !ca.allowed_principals.iter().any(|p| p == principal) {
                return Err(CaError::InvalidPrincipal(principal.clone()));
            }
        }
        if validity_s > ca.max_validity_s {
            return Err(CaError::ValidityTooLong {
                requested: validity_s,
                max: ca.max_validity_s,
            });
        }

        let user_key = PublicKey::from_openssh(public_key)
            .map_err(|e| CaError::InvalidPublicKey(e.to_string()))?;

        let signing_key = self.load_private_key(&ca).await?;

        // The serial must be durable before the certificate leaves the CA.
        let serial = self.store.next_ca_serial(&ca.name)?;

        #[allow(clippy::cast_sign_loss)]
        let valid_after = Utc::now().timestamp() as u64;
        let valid_before = valid_after + validity_s;

        let mut builder = CertBuilder::new_with_random_nonce(
            &mut OsRng,
            user_key.key_data().clone(),
            valid_after,
            valid_before,
        )?;
        builder.serial(serial)?;
        builder.key_id(key_id)?;
        builder.cert_type(CertType::User)?;
        for principal in principals {
            builder.valid_principal(principal.clone())?;
        }
        for extension in STANDARD_EXTENSIONS {
            builder.extension(extension, "")?;
        }
        if let Some(session_id) = session_id {
            builder.extension(SESSION_ID_EXTENSION, session_id)?;
        }

        let certificate = builder.sign(&signing_key)?;

        tracing::info!(
            key_id,
            serial,
            validity_s,
            principals = ?principals,
            "signed SSH certificate"
        );

        Ok(certificate.to_openssh()?)
    }

    async fn load_private_key(&self, ca: &SshCaConfig) -> Result<PrivateKey> {
        let secret = self.secrets.get(&ca.private_key_ref).await.map_err(|e| {
            if matches!(e, gough_secrets::SecretsError::NotFound(_)) {
                CaError::MissingPrivateKey(ca.private_key_ref.clone())
            } else {
                CaError::Secrets(e)
            }
        })?;

        let pem = secret
            .get(PRIVATE_KEY_FIELD)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| CaError::MissingPrivateKey(ca.private_key_ref.clone()))?;

        Ok(PrivateKey::from_openssh(pem)?)
    }
}

/// Generate a certificate key id: `<user_email>@<resource_id>-<unix_ts>`.
///
/// The format is deterministic so audit events can be correlated with the
/// certificates that produced them.
#[must_use]
pub fn generate_key_id(user_email: &str, resource_id: &str, now: DateTime<Utc>) -> String {
    format!("{user_email}@{resource_id}-{}", now.timestamp())
}
