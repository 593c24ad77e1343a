//! HTTP and WebSocket gateway for the gough control plane.
//!
//! The gateway is the only externally reachable surface of the control
//! plane. It owns authentication extraction, rate limiting, request ids,
//! the route table, and the browser terminal bridge; all domain behavior
//! lives in `gough-control`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod auth;
pub mod config;
pub mod error;
mod handlers;
pub mod metrics;
pub mod ratelimit;
pub mod routes;
pub mod state;
mod ws;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::GatewayState;
