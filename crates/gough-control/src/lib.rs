//! Control plane services for gough.
//!
//! This crate is the coordination layer between the HTTP gateway and the
//! leaf crates:
//!
//! - [`permissions`]: team-role and resource-assignment evaluation
//! - [`tokens`]: JWT issuing and verification for users and agents
//! - [`identity`]: agent enrollment and rotating-refresh token discipline
//! - [`heartbeat`]: agent heartbeat processing and the command channel
//! - [`orchestrator`]: per-request cloud dispatch and the machine cache
//! - [`sync`]: periodic inventory reconciliation
//! - [`webhooks`]: HMAC-verified provider event ingestion
//! - [`broker`]: permission-checked shell session establishment
//! - [`audit`]: append-only audit trail
//!
//! Services share the store handle and are individually cheap to clone
//! behind `Arc`s; the gateway wires them together at startup.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod broker;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod orchestrator;
pub mod permissions;
pub mod sync;
pub mod tokens;
pub mod types;
pub mod webhooks;

pub use audit::Auditor;
pub use broker::SessionBroker;
pub use error::{ControlError, Result};
pub use heartbeat::Heartbeats;
pub use identity::AgentIdentity;
pub use orchestrator::MachineOrchestrator;
pub use permissions::PermissionEvaluator;
pub use sync::InventorySync;
pub use tokens::{Subject, TokenPair, TokenService};

use std::time::Duration;

/// Tunables for the control plane services.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Interval agents are told to heartbeat at.
    pub heartbeat_interval_s: u64,
    /// Inventory sync period per provider (jittered ±10%).
    pub sync_interval_s: u64,
    /// Ceiling on inline waiting for fast machine operations.
    pub max_inline_wait_s: u64,
    /// Team policy ceiling on shell certificate validity.
    pub session_validity_s: u64,
    /// Enrollment key lifetime.
    pub enrollment_key_ttl_s: u64,
    /// Access token lifetime.
    pub access_token_ttl_s: u64,
    /// Refresh token lifetime.
    pub refresh_token_ttl_s: u64,
    /// Heartbeats missed before an agent is marked unreachable.
    pub unreachable_after_intervals: u32,
    /// Silence before an unreachable agent is suspended.
    pub suspend_after_s: u64,
}

impl ControlConfig {
    /// The unreachable threshold as a duration.
    #[must_use]
    pub fn unreachable_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::from(self.unreachable_after_intervals)
                * i64::try_from(self.heartbeat_interval_s).unwrap_or(30),
        )
    }

    /// The suspend threshold as a duration.
    #[must_use]
    pub fn suspend_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.suspend_after_s).unwrap_or(3600))
    }

    /// The inline wait ceiling as a duration.
    #[must_use]
    pub fn max_inline_wait(&self) -> Duration {
        Duration::from_secs(self.max_inline_wait_s)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 30,
            sync_interval_s: 60,
            max_inline_wait_s: 30,
            session_validity_s: 3600,
            enrollment_key_ttl_s: 24 * 3600,
            access_token_ttl_s: 15 * 60,
            refresh_token_ttl_s: 30 * 24 * 3600,
            unreachable_after_intervals: 3,
            suspend_after_s: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_thresholds() {
        let config = ControlConfig::default();
        assert_eq!(config.unreachable_after(), chrono::Duration::seconds(90));
        assert_eq!(config.suspend_after(), chrono::Duration::seconds(3600));
        assert_eq!(config.max_inline_wait(), Duration::from_secs(30));
    }
}
