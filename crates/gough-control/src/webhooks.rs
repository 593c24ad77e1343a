//! Inbound provider webhook processing (MaaS).
//!
//! Webhooks shortcut the sync loop for a single machine. The signature is
//! HMAC-SHA256 over the raw body with the per-provider shared secret;
//! verification uses a constant-time comparison. Duplicate deliveries are
//! swallowed via the webhook event log.

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use gough_core::ProviderId;
use gough_store::{Store, WebhookEvent};

use crate::error::{ControlError, Result};
use crate::orchestrator::MachineOrchestrator;

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature header against the raw body.
///
/// Accepts the `sha256=<hex>` form as well as the bare hex digest.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// The webhook processor.
pub struct WebhookProcessor<S: Store> {
    orchestrator: Arc<MachineOrchestrator<S>>,
    secrets: Arc<dyn gough_secrets::SecretsBackend>,
}

/// Outcome of processing one webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// First delivery; the machine was reconciled.
    Processed,
    /// The same event tuple was already recorded; nothing further done.
    Duplicate,
}

impl<S: Store + 'static> WebhookProcessor<S> {
    /// Create the processor.
    #[must_use]
    pub fn new(
        orchestrator: Arc<MachineOrchestrator<S>>,
        secrets: Arc<dyn gough_secrets::SecretsBackend>,
    ) -> Self {
        Self {
            orchestrator,
            secrets,
        }
    }

    /// Process a MaaS webhook delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Auth`] for signature mismatches or providers
    /// without a configured webhook secret, [`ControlError::Validation`]
    /// for bodies without a machine reference.
    pub async fn process_maas(
        &self,
        provider_id: &ProviderId,
        body: &[u8],
        signature: &str,
        event_type: &str,
    ) -> Result<WebhookOutcome> {
        let provider = self.orchestrator.provider(provider_id)?;

        let secret_ref = provider
            .webhook_secret_ref
            .as_ref()
            .ok_or_else(|| ControlError::Auth("provider has no webhook secret".into()))?;
        let secret_map = self.secrets.get(secret_ref).await?;
        let secret = secret_map
            .get("secret")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ControlError::Auth("webhook secret is malformed".into()))?;

        if !verify_signature(secret, body, signature) {
            return Err(ControlError::Auth("invalid webhook signature".into()));
        }

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ControlError::Validation(format!("invalid webhook body: {e}")))?;
        let resource_id = payload
            .get("system_id")
            .or_else(|| payload.get("resource_id"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ControlError::Validation("webhook body names no machine".into()))?
            .to_string();

        let event = WebhookEvent {
            source: "maas".to_string(),
            event_type: event_type.to_string(),
            resource_id: resource_id.clone(),
            payload,
            received_at: Utc::now(),
            processed: true,
        };
        let store = self.orchestrator.store();
        if !store.record_webhook_event(&event)? {
            tracing::debug!(event_type, resource_id, "duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        // Reconcile the single affected machine ahead of the next sync
        // cycle. A machine the provider no longer knows is terminated.
        match self.orchestrator.get_machine(provider_id, &resource_id).await {
            Ok(_) => {}
            Err(ControlError::Provider(gough_clouds::CloudError::NotFound(_))) => {
                self.orchestrator.mark_terminated(provider_id, &resource_id)?;
            }
            Err(e) => {
                tracing::warn!(
                    resource_id,
                    error = %e,
                    "webhook reconcile failed; sync loop will retry"
                );
            }
        }

        Ok(WebhookOutcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"system_id":"s-01"}"#;
        let header = sign("shared-secret", body);
        assert!(verify_signature("shared-secret", body, &header));
    }

    #[test]
    fn bare_hex_digest_verifies() {
        let body = b"payload";
        let header = sign("k", body);
        let bare = header.strip_prefix("sha256=").unwrap();
        assert!(verify_signature("k", body, bare));
    }

    #[test]
    fn wrong_secret_or_body_fails() {
        let body = br#"{"system_id":"s-01"}"#;
        let header = sign("shared-secret", body);
        assert!(!verify_signature("other-secret", body, &header));
        assert!(!verify_signature("shared-secret", b"tampered", &header));
        assert!(!verify_signature("shared-secret", body, "sha256=zz-not-hex"));
    }
}
