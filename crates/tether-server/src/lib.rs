//! # tether-server
//!
//! HTTP control API and WebSocket device gateway for the Tether bridge.
//!
//! The server embeds a [`LocalBroker`](tether_transport::LocalBroker).
//! Devices connect to the gateway and publish on their `devices/{id}/...`
//! topics; HTTP callers list devices and send commands, each command
//! blocking until the device answers or the deadline passes.

pub mod api;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use server::{build_router, run_server, AppState};
