//! Router client: registration, heartbeat reporting, and the status
//! snapshots that feed it.

mod client;
mod status;

pub use client::GatewayClient;
pub use status::StatusCollector;
