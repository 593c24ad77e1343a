//! Append-only audit trail.

use std::sync::Arc;

use chrono::Utc;
use gough_store::{AuditEvent, Store};

/// Audit event writer.
///
/// Recording is best-effort: a failed audit write is logged but never fails
/// the operation being audited.
pub struct Auditor<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for Auditor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> Auditor<S> {
    /// Create an auditor over the store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Record one event.
    pub fn record(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        outcome: &str,
        details: serde_json::Value,
        request_id: &str,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            outcome: outcome.to_string(),
            details,
            request_id: request_id.to_string(),
        };
        if let Err(e) = self.store.append_audit(&event) {
            tracing::error!(action, error = %e, "failed to append audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gough_store::RocksStore;

    #[test]
    fn records_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let auditor = Auditor::new(Arc::clone(&store));

        auditor.record(
            "user:abc",
            "shell.open",
            "vm",
            "vm-42",
            "success",
            serde_json::json!({"session_id": "s-1"}),
            "req-1",
        );

        let events = store.recent_audit(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "shell.open");
        assert_eq!(events[0].outcome, "success");
    }
}
