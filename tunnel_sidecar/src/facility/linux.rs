//! Linux implementation of the host facilities
//!
//! Packet filtering goes through `iptables`/`ip6tables`, routing through
//! `ip`, the tunnel through `wg-quick` and `wg`, and child processes through
//! `tokio::process` plus `nix` for signal delivery.

use super::{
    ChainPolicy, DefaultRoute, FacilityError, FacilityResult, FirewallFacility, FirewallRule,
    InterfaceCounters, IpFamily, ProcessFacility, TunnelFacility,
};
use async_trait::async_trait;
use ipnet::IpNet;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PROC_NET_DEV: &str = "/proc/net/dev";

/// Linux facility backed by the standard networking tools
pub struct LinuxFacility {
    /// Children spawned by this process, keyed by pid
    children: Mutex<HashMap<u32, Child>>,
}

impl Default for LinuxFacility {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxFacility {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    fn iptables(family: IpFamily) -> &'static str {
        match family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    async fn run_rule(&self, op: &str, rule: &FirewallRule) -> FacilityResult<()> {
        let mut args: Vec<&str> = vec!["-w", op, "OUTPUT"];
        args.extend(rule.args.iter().map(String::as_str));
        run_command(Self::iptables(rule.family), &args).await?;
        Ok(())
    }
}

/// Run a system command and return its stdout
pub(crate) async fn run_command(cmd: &str, args: &[&str]) -> FacilityResult<String> {
    debug!("Running command: {} {:?}", cmd, args);

    let output = TokioCommand::new(cmd).args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let command = format!("{} {}", cmd, args.join(" "));
        if is_permission_error(&stderr) {
            return Err(FacilityError::PermissionDenied(command));
        }
        debug!("Command failed: {} {}", output.status, stderr);
        return Err(FacilityError::CommandFailed { command, stderr });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    debug!("Command output: {}", stdout);

    Ok(stdout)
}

fn is_permission_error(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("must be root")
}

/// Extract counters for `interface` from `/proc/net/dev` contents.
pub fn parse_proc_net_dev(contents: &str, interface: &str) -> Option<InterfaceCounters> {
    contents.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        if fields.len() < 9 {
            return None;
        }
        Some(InterfaceCounters {
            rx_bytes: fields[0],
            tx_bytes: fields[8],
        })
    })
}

/// Parse `ip route show default` output ("default via X dev Y ...").
pub fn parse_default_route(output: &str) -> Option<DefaultRoute> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            return None;
        }
        let value_after = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };
        let gateway = value_after("via")?.parse().ok()?;
        let device = value_after("dev")?.to_string();
        Some(DefaultRoute { gateway, device })
    })
}

/// Parse the MTU out of `ip link show` output.
pub fn parse_link_mtu(output: &str) -> Option<u32> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    tokens
        .iter()
        .position(|t| *t == "mtu")
        .and_then(|i| tokens.get(i + 1))
        .and_then(|v| v.parse().ok())
}

#[async_trait]
impl FirewallFacility for LinuxFacility {
    async fn rule_exists(&self, rule: &FirewallRule) -> FacilityResult<bool> {
        match self.run_rule("-C", rule).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_permission_denied() => Err(e),
            Err(FacilityError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn insert_rule(&self, rule: &FirewallRule) -> FacilityResult<()> {
        info!("Inserting firewall rule: {}", rule);
        self.run_rule("-I", rule).await
    }

    async fn append_rule(&self, rule: &FirewallRule) -> FacilityResult<()> {
        info!("Appending firewall rule: {}", rule);
        self.run_rule("-A", rule).await
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> FacilityResult<()> {
        info!("Deleting firewall rule: {}", rule);
        match self.run_rule("-D", rule).await {
            Err(FacilityError::CommandFailed { stderr, .. })
                if stderr.contains("does a matching rule exist")
                    || stderr.contains("Bad rule") =>
            {
                info!("Rule {} already absent; treating as success", rule);
                Ok(())
            }
            other => other,
        }
    }

    async fn set_output_policy(
        &self,
        family: IpFamily,
        policy: ChainPolicy,
    ) -> FacilityResult<()> {
        info!("Setting {:?} OUTPUT policy to {}", family, policy.as_str());
        run_command(
            Self::iptables(family),
            &["-w", "-P", "OUTPUT", policy.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn default_route(&self) -> FacilityResult<Option<DefaultRoute>> {
        let output = run_command("ip", &["route", "show", "default"]).await?;
        Ok(parse_default_route(&output))
    }

    async fn add_route(&self, destination: &IpNet, via: &DefaultRoute) -> FacilityResult<()> {
        info!(
            "Adding route: destination={}, gateway={}, interface={}",
            destination, via.gateway, via.device
        );
        let dest = destination.to_string();
        let gateway = via.gateway.to_string();
        let family = match destination {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        };
        run_command(
            "ip",
            &[
                family, "route", "replace", &dest, "via", &gateway, "dev", &via.device,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_route(&self, destination: &IpNet) -> FacilityResult<()> {
        info!("Removing route: destination={}", destination);
        let dest = destination.to_string();
        match run_command("ip", &["route", "del", &dest]).await {
            Ok(_) => Ok(()),
            Err(FacilityError::CommandFailed { stderr, .. })
                if stderr.contains("No such process")
                    || stderr.contains("Cannot find device")
                    || stderr.contains("No such device") =>
            {
                info!("Route {} already absent; treating as success", destination);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_resolver(&self, path: &Path) -> FacilityResult<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_resolver(&self, path: &Path, contents: &str) -> FacilityResult<()> {
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

#[async_trait]
impl TunnelFacility for LinuxFacility {
    async fn bring_up(&self, config: &Path) -> FacilityResult<()> {
        let path = config.to_string_lossy();
        info!("Bringing tunnel up from {}", path);
        run_command("wg-quick", &["up", &path]).await?;
        Ok(())
    }

    async fn tear_down(&self, config: &Path) -> FacilityResult<()> {
        let path = config.to_string_lossy();
        info!("Tearing tunnel down from {}", path);
        match run_command("wg-quick", &["down", &path]).await {
            Ok(_) => Ok(()),
            Err(FacilityError::CommandFailed { stderr, .. })
                if stderr.contains("is not a WireGuard interface")
                    || stderr.contains("does not exist") =>
            {
                info!("Tunnel already down");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn interface_exists(&self, interface: &str) -> bool {
        run_command("ip", &["link", "show", "dev", interface])
            .await
            .is_ok()
    }

    async fn show(&self, interface: &str) -> FacilityResult<String> {
        run_command("wg", &["show", interface]).await
    }

    async fn counters(&self, interface: &str) -> FacilityResult<Option<InterfaceCounters>> {
        let contents = tokio::fs::read_to_string(PROC_NET_DEV).await?;
        Ok(parse_proc_net_dev(&contents, interface))
    }

    async fn interface_mtu(&self, interface: &str) -> FacilityResult<Option<u32>> {
        match run_command("ip", &["link", "show", "dev", interface]).await {
            Ok(output) => Ok(parse_link_mtu(&output)),
            Err(FacilityError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProcessFacility for LinuxFacility {
    async fn spawn(&self, program: &str, args: &[String]) -> FacilityResult<u32> {
        debug!("Spawning: {} {:?}", program, args);
        let child = TokioCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| FacilityError::NotFound(format!("pid of {}", program)))?;
        self.children.lock().await.insert(pid, child);
        Ok(pid)
    }

    async fn is_running(&self, pid: u32) -> bool {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&pid) else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Process {} exited with {}", pid, status);
                false
            }
            Err(e) => {
                warn!("Failed to poll process {}: {}", pid, e);
                false
            }
        }
    }

    async fn terminate(&self, pid: u32, timeout: Duration) -> FacilityResult<()> {
        // Take the child out so the lock is not held while waiting
        let Some(mut child) = self.children.lock().await.remove(&pid) else {
            return Ok(());
        };

        let raw = i32::try_from(pid).map_err(|_| FacilityError::NotFound(pid.to_string()))?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                return Err(FacilityError::PermissionDenied(format!("signal {}", pid)))
            }
            Err(e) => warn!("Failed to signal process {}: {}", pid, e),
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process {} stopped with {}", pid, status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("Process {} ignored SIGTERM for {:?}; killing", pid, timeout);
                if let Err(e) = child.start_kill() {
                    error!("Failed to kill process {}: {}", pid, e);
                }
                let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                Ok(())
            }
        }
    }

    async fn count_processes(&self, name: &str, roles: &[&str]) -> FacilityResult<usize> {
        let output = run_command("ps", &["-eo", "args"]).await?;
        Ok(output
            .lines()
            .filter(|line| line.contains(name) && roles.iter().any(|r| line.contains(r)))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    7000    0    0    0     0          0         0  5432100    6000    0    0    0     0       0          0
   wg0:   20480      40    0    0    0     0          0         0     4096      30    0    0    0     0       0          0
";

    #[test]
    fn test_parse_proc_net_dev() {
        let counters = parse_proc_net_dev(PROC_SAMPLE, "wg0").unwrap();
        assert_eq!(counters.rx_bytes, 20480);
        assert_eq!(counters.tx_bytes, 4096);
        assert!(parse_proc_net_dev(PROC_SAMPLE, "wg1").is_none());
    }

    #[test]
    fn test_parse_default_route() {
        let route =
            parse_default_route("default via 172.17.0.1 dev eth0 proto dhcp metric 100\n").unwrap();
        assert_eq!(route.gateway.to_string(), "172.17.0.1");
        assert_eq!(route.device, "eth0");
        assert!(parse_default_route("10.0.0.0/8 dev eth0 scope link\n").is_none());
        assert!(parse_default_route("").is_none());
    }

    #[test]
    fn test_parse_link_mtu() {
        let out = "2: eth0@if5: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UP";
        assert_eq!(parse_link_mtu(out), Some(1450));
        assert_eq!(parse_link_mtu("garbage"), None);
    }

    #[test]
    fn test_permission_error_detection() {
        assert!(is_permission_error(
            "iptables v1.8.7 (legacy): can't initialize iptables table `filter': Permission denied (you must be root)"
        ));
        assert!(is_permission_error("RTNETLINK answers: Operation not permitted"));
        assert!(!is_permission_error("iptables: Bad rule"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let facility = LinuxFacility::new();
        let pid = facility
            .spawn("sleep", &["30".to_string()])
            .await
            .unwrap();
        assert!(facility.is_running(pid).await);
        facility
            .terminate(pid, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!facility.is_running(pid).await);
    }
}
