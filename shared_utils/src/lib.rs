//! Shared utilities for the tunnel sidecar.
//!
//! This crate provides the configuration model (defaults, TOML file and
//! environment overrides) and the structured logging setup used by the
//! sidecar daemon and its tests.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{ConfigError, SidecarConfig};
