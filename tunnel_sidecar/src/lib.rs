//! Tunnel sidecar library
//!
//! Brings a WireGuard tunnel up inside a container, keeps all egress on it,
//! supervises the local proxy daemons and reports health and proxy metrics
//! over HTTP. The binary in `main.rs` wires these pieces to the host.

pub mod error;
pub mod facility;
pub mod health;
pub mod http;
pub mod metrics;
pub mod policy;
pub mod root;
pub mod supervisor;
pub mod tunnel;

pub use error::{SidecarError, SidecarResult};
pub use root::{Facilities, Sidecar};
