use super::config_file::PeerEndpoint;
use std::fmt;
use std::time::SystemTime;

/// Lifecycle state of the tunnel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Down,
    BringingUp,
    Up,
    Degraded,
    Reconnecting,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Down => "down",
            TunnelState::BringingUp => "bringing_up",
            TunnelState::Up => "up",
            TunnelState::Degraded => "degraded",
            TunnelState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the tunnel published by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSnapshot {
    pub state: TunnelState,
    pub interface: String,
    pub peer: Option<PeerEndpoint>,
    /// Last time the interface was observed present
    pub last_up: Option<SystemTime>,
}

impl TunnelSnapshot {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            state: TunnelState::Down,
            interface: interface.into(),
            peer: None,
            last_up: None,
        }
    }
}
