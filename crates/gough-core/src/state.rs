//! The unified machine lifecycle state.
//!
//! Every cloud driver owns a static map from its native state space into this
//! enum. The control plane never invents transitions; it only records what
//! providers report.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified machine state across all providers.
///
/// The first six variants are common to every backend. The last four are
/// MaaS bare-metal lifecycle states; other drivers never produce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MachineState {
    /// Being created or provisioned.
    Pending = 1,
    /// Running and accessible.
    Running = 2,
    /// Stopped but still exists.
    Stopped = 3,
    /// Destroyed or deleted.
    Terminated = 4,
    /// In an error state.
    Error = 5,
    /// State cannot be determined.
    Unknown = 6,
    /// MaaS: hardware commissioning in progress.
    Commissioning = 7,
    /// MaaS: OS deployment in progress.
    Deploying = 8,
    /// MaaS: ready for allocation.
    Ready = 9,
    /// MaaS: allocated to a user, not yet deployed.
    Allocated = 10,
}

impl MachineState {
    /// Convert the state to its numeric representation for index keys.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value back to a `MachineState`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Running),
            3 => Some(Self::Stopped),
            4 => Some(Self::Terminated),
            5 => Some(Self::Error),
            6 => Some(Self::Unknown),
            7 => Some(Self::Commissioning),
            8 => Some(Self::Deploying),
            9 => Some(Self::Ready),
            10 => Some(Self::Allocated),
            _ => None,
        }
    }

    /// The snake_case name used on the wire and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Error => "error",
            Self::Unknown => "unknown",
            Self::Commissioning => "commissioning",
            Self::Deploying => "deploying",
            Self::Ready => "ready",
            Self::Allocated => "allocated",
        }
    }

    /// True for states a machine never leaves on its own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// True for the MaaS-only lifecycle states.
    #[must_use]
    pub const fn is_maas_specific(self) -> bool {
        matches!(
            self,
            Self::Commissioning | Self::Deploying | Self::Ready | Self::Allocated
        )
    }

    /// True while the provider is still working towards a stable state.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Pending | Self::Commissioning | Self::Deploying)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
