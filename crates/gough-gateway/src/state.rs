//! Gateway application state.

use std::sync::Arc;

use gough_ca::CertificateAuthority;
use gough_control::{
    AgentIdentity, Auditor, Heartbeats, MachineOrchestrator, PermissionEvaluator, SessionBroker,
    TokenService,
};
use gough_store::Store;

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;

/// Shared application state for the gateway.
///
/// Holds every control plane service the request handlers dispatch into.
pub struct GatewayState<S: Store> {
    /// The store, for handlers that read entities directly.
    pub store: Arc<S>,
    /// The secrets backend, for credential writes at provider registration.
    pub secrets: Arc<dyn gough_secrets::SecretsBackend>,
    /// JWT issuing and verification.
    pub tokens: Arc<TokenService>,
    /// Enrollment and token rotation.
    pub identity: Arc<AgentIdentity<S>>,
    /// Heartbeat processing and command queues.
    pub heartbeats: Arc<Heartbeats<S>>,
    /// Permission evaluation.
    pub permissions: PermissionEvaluator<S>,
    /// Machine dispatch and the cache.
    pub orchestrator: Arc<MachineOrchestrator<S>>,
    /// Webhook processing.
    pub webhooks: Arc<gough_control::webhooks::WebhookProcessor<S>>,
    /// Shell session brokering.
    pub broker: Arc<SessionBroker<S>>,
    /// Certificate authority.
    pub ca: Arc<CertificateAuthority<S>>,
    /// Audit trail writer.
    pub auditor: Auditor<S>,
    /// Rate limiter.
    pub ratelimit: Arc<RateLimiter>,
    /// Prometheus metrics.
    pub metrics: Arc<Metrics>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl<S: Store> Clone for GatewayState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            secrets: Arc::clone(&self.secrets),
            tokens: Arc::clone(&self.tokens),
            identity: Arc::clone(&self.identity),
            heartbeats: Arc::clone(&self.heartbeats),
            permissions: self.permissions.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            webhooks: Arc::clone(&self.webhooks),
            broker: Arc::clone(&self.broker),
            ca: Arc::clone(&self.ca),
            auditor: self.auditor.clone(),
            ratelimit: Arc::clone(&self.ratelimit),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}
