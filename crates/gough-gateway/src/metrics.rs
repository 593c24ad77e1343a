//! Prometheus metrics.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// The gateway's metric set.
pub struct Metrics {
    registry: Registry,
    /// Requests by endpoint group and status class.
    pub http_requests: IntCounterVec,
    /// Heartbeats accepted.
    pub heartbeats: IntCounter,
    /// Shell sessions opened.
    pub sessions_opened: IntCounter,
    /// Currently live shell sessions.
    pub sessions_live: IntGauge,
    /// Inventory sync cycles completed.
    pub sync_cycles: IntCounter,
}

impl Metrics {
    /// Create and register the metric set.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails, which only happens on duplicate
    /// registration and is a programming error.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("gough_http_requests_total", "HTTP requests processed"),
            &["endpoint", "status"],
        )
        .expect("valid metric definition");
        let heartbeats = IntCounter::new("gough_heartbeats_total", "Agent heartbeats accepted")
            .expect("valid metric definition");
        let sessions_opened =
            IntCounter::new("gough_shell_sessions_opened_total", "Shell sessions opened")
                .expect("valid metric definition");
        let sessions_live = IntGauge::new("gough_shell_sessions_live", "Live shell sessions")
            .expect("valid metric definition");
        let sync_cycles =
            IntCounter::new("gough_inventory_sync_cycles_total", "Inventory sync cycles")
                .expect("valid metric definition");

        registry
            .register(Box::new(http_requests.clone()))
            .expect("register metric");
        registry
            .register(Box::new(heartbeats.clone()))
            .expect("register metric");
        registry
            .register(Box::new(sessions_opened.clone()))
            .expect("register metric");
        registry
            .register(Box::new(sessions_live.clone()))
            .expect("register metric");
        registry
            .register(Box::new(sync_cycles.clone()))
            .expect("register metric");

        Self {
            registry,
            http_requests,
            heartbeats,
            sessions_opened,
            sessions_live,
            sync_cycles,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters() {
        let metrics = Metrics::new();
        metrics.heartbeats.inc();
        metrics.sessions_opened.inc();
        metrics.sessions_live.set(3);

        let text = metrics.render();
        assert!(text.contains("gough_heartbeats_total 1"));
        assert!(text.contains("gough_shell_sessions_live 3"));
    }
}
