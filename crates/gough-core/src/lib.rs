//! Core types and utilities for gough.
//!
//! This crate provides the foundational types used throughout the gough
//! control plane and agent:
//!
//! - **Identifiers**: Strongly-typed IDs for users, teams, providers, agents,
//!   and shell sessions
//! - **Machine state**: The unified lifecycle enum every cloud driver maps
//!   its native states onto
//! - **Capabilities**: The atomic grants emitted by the permission evaluator
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use gough_core::{AgentId, Capability, MachineState, SessionId};
//!
//! let agent_id = AgentId::generate();
//! let session_id = SessionId::generate();
//!
//! assert!(MachineState::Terminated.is_terminal());
//! assert_eq!(Capability::Shell.as_str(), "shell");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod caps;
pub mod error;
pub mod ids;
pub mod state;

pub use caps::{Capabilities, Capability};
pub use error::{CoreError, Result};
pub use ids::{AgentId, IdError, ProviderId, SessionId, TeamId, UserId};
pub use state::MachineState;
