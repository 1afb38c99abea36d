//! Tunnel interface management.

pub mod config_file;
pub mod controller;
pub mod types;

pub use config_file::{tunnel_mtu, PeerEndpoint, TunnelConfigFile};
pub use controller::TunnelController;
pub use types::{TunnelSnapshot, TunnelState};
