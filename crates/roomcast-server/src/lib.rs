//! # roomcast-server
//!
//! The Roomcast gateway server: configuration, the HTTP/WebSocket front
//! end, authentication, and metrics around a [`roomcast_core::ConnectionGateway`].
//!
//! The binary is a thin wrapper over [`run_server`]; tests drive
//! [`AppState::start`] and [`serve`] directly to run several instances
//! over one in-memory broker.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{router, run_server, serve, AppState};
