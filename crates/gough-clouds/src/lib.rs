//! Provider-polymorphic cloud machine lifecycle layer.
//!
//! This crate provides a unified interface for managing machines across
//! heterogeneous backends. The [`CloudDriver`] trait defines the contract
//! every driver implements; the [`DriverRegistry`] creates drivers by
//! backend name from a credentials map.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  DriverRegistry  │  ← creates drivers by backend name
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  dyn CloudDriver │  ← unified contract (§ state model, error taxonomy)
//! └────────┬─────────┘
//!          │
//!   ┌──────┼──────┬───────┬───────┬───────┐
//!   ▼      ▼      ▼       ▼       ▼       ▼
//! ┌────┐ ┌────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐
//! │MaaS│ │LXD │ │ AWS │ │ GCP │ │Azure│ │Vultr│
//! └────┘ └────┘ └─────┘ └─────┘ └─────┘ └─────┘
//! ```
//!
//! Each driver is one file and owns a static map from its native state space
//! into [`MachineState`]. Cross-driver behavior (polling, IP classification)
//! lives in this module and [`util`]; anything orchestration-level lives in
//! the control plane, not here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod aws;
pub mod azure;
pub mod error;
pub mod gcp;
pub mod lxd;
pub mod maas;
pub mod registry;
pub mod types;
pub mod util;
pub mod vultr;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gough_core::MachineState;

pub use error::{CloudError, Result};
pub use registry::{DriverConfig, DriverRegistry};
pub use types::{Descriptor, Machine, MachineFilters, MachineSpec};

/// Hard timeout applied to every outbound provider call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum poll interval for [`CloudDriver::wait_for_state`].
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The contract every cloud driver implements.
///
/// Drivers are safe for concurrent use and surface exactly the four error
/// kinds of [`CloudError`]. Listing operations hide provider pagination.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// The backend name (`maas`, `lxd`, `aws`, `gcp`, `azure`, `vultr`).
    fn name(&self) -> &'static str;

    /// Whether the backend accepts cloud-init user data.
    fn supports_cloud_init(&self) -> bool {
        true
    }

    /// Verify credentials with the provider.
    ///
    /// Idempotent; called lazily on first use and once more after an auth
    /// error before the operation is retried.
    async fn authenticate(&self) -> Result<()>;

    /// List machines, fully paginated.
    async fn list_machines(&self, filters: &MachineFilters) -> Result<Vec<Machine>>;

    /// Get one machine by provider id.
    async fn get_machine(&self, id: &str) -> Result<Machine>;

    /// Create a machine.
    ///
    /// Blocks until the provider returns an object reference; does **not**
    /// block until the machine is running.
    async fn create_machine(&self, spec: &MachineSpec) -> Result<Machine>;

    /// Destroy a machine.
    async fn destroy_machine(&self, id: &str) -> Result<()>;

    /// Start a stopped machine.
    async fn start_machine(&self, id: &str) -> Result<()>;

    /// Stop a running machine.
    async fn stop_machine(&self, id: &str) -> Result<()>;

    /// Reboot a machine. The default stops then starts; drivers with a
    /// native reboot call override this.
    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.stop_machine(id).await?;
        self.start_machine(id).await
    }

    /// List available images.
    async fn list_images(&self, _filters: &MachineFilters) -> Result<Vec<Descriptor>> {
        Ok(Vec::new())
    }

    /// List available machine sizes.
    async fn list_sizes(&self) -> Result<Vec<Descriptor>> {
        Ok(Vec::new())
    }

    /// List available regions or zones.
    async fn list_regions(&self) -> Result<Vec<Descriptor>> {
        Ok(Vec::new())
    }

    /// Console output for a machine. Providers without the feature return
    /// an empty string.
    async fn get_console_output(&self, _id: &str) -> Result<String> {
        Ok(String::new())
    }

    /// Poll until the machine reaches `target`, the machine errors, the
    /// timeout elapses, or `cancel` fires.
    ///
    /// The poll interval starts at [`MIN_POLL_INTERVAL`] and backs off.
    async fn wait_for_state(
        &self,
        id: &str,
        target: MachineState,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Machine> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = MIN_POLL_INTERVAL;

        loop {
            let machine = self.get_machine(id).await?;
            if machine.state == target {
                return Ok(machine);
            }
            if machine.state == MachineState::Error {
                return Err(CloudError::cloud(format!(
                    "machine {id} entered error state while waiting for {target}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CloudError::timeout(format!(
                    "timeout waiting for machine {id} to reach {target}"
                )));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(CloudError::cloud(format!(
                        "wait for machine {id} cancelled"
                    )));
                }
                () = tokio::time::sleep(interval) => {}
            }

            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

/// Reject non-empty cloud-init on drivers without support for it.
///
/// # Errors
///
/// Returns [`CloudError::Cloud`] naming the driver when `cloud_init` is
/// non-empty.
pub fn reject_cloud_init(driver: &str, spec: &MachineSpec) -> Result<()> {
    if spec.cloud_init.is_empty() {
        Ok(())
    } else {
        Err(CloudError::cloud(format!(
            "driver {driver} does not support cloud-init user data"
        )))
    }
}
