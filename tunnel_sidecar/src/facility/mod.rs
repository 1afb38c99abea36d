//! Capability interfaces for the privileged host facilities.
//!
//! The state machine, the egress policy and the health inference depend on
//! these traits only. [`linux::LinuxFacility`] implements them by invoking
//! the usual tools (`iptables`, `ip`, `wg`, `wg-quick`, `ps`); tests supply
//! in-memory fakes.

pub mod linux;

use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use linux::LinuxFacility;

/// Result type for facility operations
pub type FacilityResult<T> = Result<T, FacilityError>;

/// Error type for facility operations
#[derive(Error, Debug)]
pub enum FacilityError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// External command exited unsuccessfully
    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The host refused the operation for lack of privilege
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Tool output could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// Referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl FacilityError {
    /// Whether the failure stems from missing privileges (degrade, never abort).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            FacilityError::PermissionDenied(_) => true,
            FacilityError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// Address family a packet filter rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }
}

/// Default policy of the egress chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPolicy {
    Accept,
    Drop,
}

impl ChainPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainPolicy::Accept => "ACCEPT",
            ChainPolicy::Drop => "DROP",
        }
    }
}

/// A rule in the egress (OUTPUT) chain, stored as its match arguments so the
/// same value can be checked, inserted and deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub family: IpFamily,
    pub args: Vec<String>,
}

impl FirewallRule {
    fn output(family: IpFamily, args: &[&str]) -> Self {
        FirewallRule {
            family,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn allow_loopback(family: IpFamily) -> Self {
        Self::output(family, &["-o", "lo", "-j", "ACCEPT"])
    }

    pub fn allow_established(family: IpFamily) -> Self {
        Self::output(
            family,
            &[
                "-m",
                "conntrack",
                "--ctstate",
                "ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ],
        )
    }

    pub fn allow_interface(family: IpFamily, interface: &str) -> Self {
        Self::output(family, &["-o", interface, "-j", "ACCEPT"])
    }

    /// Egress UDP to the tunnel peer, needed for the handshake before lockdown.
    pub fn allow_udp_peer(peer: IpAddr, port: u16) -> Self {
        let dest = peer.to_string();
        let port = port.to_string();
        Self::output(
            IpFamily::of(&peer),
            &["-p", "udp", "-d", &dest, "--dport", &port, "-j", "ACCEPT"],
        )
    }

    pub fn allow_destination(net: &IpNet) -> Self {
        let dest = net.to_string();
        Self::output(IpFamily::of_net(net), &["-d", &dest, "-j", "ACCEPT"])
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} OUTPUT {}", self.family, self.args.join(" "))
    }
}

/// Route used by traffic before the tunnel existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: IpAddr,
    pub device: String,
}

/// Cumulative byte counters of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Packet filter, routing table and resolver file.
#[async_trait]
pub trait FirewallFacility: Send + Sync {
    /// Whether an identical rule is already present
    async fn rule_exists(&self, rule: &FirewallRule) -> FacilityResult<bool>;

    /// Insert a rule at the top of the egress chain
    async fn insert_rule(&self, rule: &FirewallRule) -> FacilityResult<()>;

    /// Append a rule to the egress chain
    async fn append_rule(&self, rule: &FirewallRule) -> FacilityResult<()>;

    /// Delete a rule from the egress chain
    async fn delete_rule(&self, rule: &FirewallRule) -> FacilityResult<()>;

    /// Set the default policy of the egress chain
    async fn set_output_policy(&self, family: IpFamily, policy: ChainPolicy)
        -> FacilityResult<()>;

    /// Current default route, if any
    async fn default_route(&self) -> FacilityResult<Option<DefaultRoute>>;

    /// Route a destination through the given gateway (replaces an existing route)
    async fn add_route(&self, destination: &IpNet, via: &DefaultRoute) -> FacilityResult<()>;

    /// Remove a destination route; an absent route is not an error
    async fn delete_route(&self, destination: &IpNet) -> FacilityResult<()>;

    async fn read_resolver(&self, path: &Path) -> FacilityResult<String>;

    async fn write_resolver(&self, path: &Path, contents: &str) -> FacilityResult<()>;
}

/// Tunnel interface lifecycle and introspection.
#[async_trait]
pub trait TunnelFacility: Send + Sync {
    /// Bring the tunnel up from a config file
    async fn bring_up(&self, config: &Path) -> FacilityResult<()>;

    /// Tear the tunnel down
    async fn tear_down(&self, config: &Path) -> FacilityResult<()>;

    async fn interface_exists(&self, interface: &str) -> bool;

    /// Raw peer/handshake/transfer report for the interface
    async fn show(&self, interface: &str) -> FacilityResult<String>;

    /// Cumulative counters, `None` when the interface is absent
    async fn counters(&self, interface: &str) -> FacilityResult<Option<InterfaceCounters>>;

    /// MTU of an interface, `None` when it is absent
    async fn interface_mtu(&self, interface: &str) -> FacilityResult<Option<u32>>;
}

/// Child process control.
#[async_trait]
pub trait ProcessFacility: Send + Sync {
    /// Launch a child and return its pid
    async fn spawn(&self, program: &str, args: &[String]) -> FacilityResult<u32>;

    async fn is_running(&self, pid: u32) -> bool;

    /// Send a termination signal and wait at most `timeout` for the exit
    async fn terminate(&self, pid: u32, timeout: Duration) -> FacilityResult<()>;

    /// Count processes whose command line contains `name` and any of `roles`
    async fn count_processes(&self, name: &str, roles: &[&str]) -> FacilityResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_rule_family() {
        let rule = FirewallRule::allow_udp_peer("2001:db8::1".parse().unwrap(), 51820);
        assert_eq!(rule.family, IpFamily::V6);
        assert!(rule.args.contains(&"51820".to_string()));
    }

    #[test]
    fn test_permission_classification() {
        let err = FacilityError::PermissionDenied("iptables".into());
        assert!(err.is_permission_denied());
        let err = FacilityError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(err.is_permission_denied());
        let err = FacilityError::Parse("x".into());
        assert!(!err.is_permission_denied());
    }
}
