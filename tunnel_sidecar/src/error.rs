//! Error type for the sidecar and its mapping to process exit codes.

use crate::facility::FacilityError;
use shared_utils::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the sidecar
pub type SidecarResult<T> = Result<T, SidecarError>;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel config not found at {0}")]
    TunnelConfigMissing(PathBuf),

    #[error("Invalid tunnel config: {0}")]
    TunnelConfigInvalid(String),

    #[error("Interface {interface} did not appear after {attempts} checks")]
    BringUpTimeout { interface: String, attempts: u32 },

    #[error("Reconnect failed after {attempts} attempt(s): {reason}")]
    ReconnectFailed { attempts: u32, reason: String },

    #[error("Required child {name} failed: {reason}")]
    RequiredChildFailed { name: String, reason: String },

    #[error("Tunnel validation failed: {0}")]
    ValidationFailed(String),

    #[error("Facility error: {0}")]
    Facility(#[from] FacilityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),
}

impl SidecarError {
    /// Process exit code for a fatal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SidecarError::Config(_)
            | SidecarError::TunnelConfigMissing(_)
            | SidecarError::TunnelConfigInvalid(_) => 2,
            SidecarError::BringUpTimeout { .. } => 3,
            SidecarError::RequiredChildFailed { .. } => 4,
            SidecarError::ValidationFailed(_) => 5,
            SidecarError::ReconnectFailed { .. } => 6,
            SidecarError::Facility(_) | SidecarError::Io(_) | SidecarError::Http(_) => 1,
        }
    }
}
