//! HTTP management API of the berth daemon.
//!
//! [`router::create_router`] builds the axum application: version
//! negotiation, CORS and per-route minimum versions wrap the handlers in
//! [`handlers`]. [`server::ApiServer`] serves it over a unix socket or TCP
//! with connection upgrades enabled, which the attach endpoint relies on.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cors;
pub mod error;
pub mod handlers;
pub mod params;
pub mod router;
pub mod server;
pub mod types;
pub mod version;

pub use router::{AppState, RouterOptions, create_router};
pub use server::ApiServer;
