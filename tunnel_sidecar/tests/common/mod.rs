//! In-memory host facilities shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use ipnet::IpNet;
use shared_utils::SidecarConfig;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tunnel_sidecar::facility::{
    ChainPolicy, DefaultRoute, FacilityError, FacilityResult, FirewallFacility, FirewallRule,
    InterfaceCounters, IpFamily, ProcessFacility, TunnelFacility,
};
use tunnel_sidecar::Facilities;

pub const TUNNEL_CONF: &str = "\
[Interface]
PrivateKey = aGVsbG8gd29ybGQgaGVsbG8gd29ybGQgaGVsbG8gd28=
Address = 10.64.0.2/32
DNS = 10.64.0.1

[Peer]
PublicKey = cGVlciBrZXkgcGVlciBrZXkgcGVlciBrZXkgcGVlcms=
AllowedIPs = 0.0.0.0/0
Endpoint = 203.0.113.7:51820
";

pub const REPORT_FRESH: &str = "\
interface: wg0
  public key: aGVsbG8=
  listening port: 41414

peer: cGVlcg==
  endpoint: 203.0.113.7:51820
  allowed ips: 0.0.0.0/0
  latest handshake: 5 seconds ago
  transfer: 14.20 KiB received, 9.84 KiB sent
";

pub const REPORT_ESTABLISHING: &str = "\
interface: wg0
  public key: aGVsbG8=

peer: cGVlcg==
  endpoint: 203.0.113.7:51820
  allowed ips: 0.0.0.0/0
  transfer: 0 B received, 148 B sent
";

pub const REPORT_STALE: &str = "\
interface: wg0
  public key: aGVsbG8=

peer: cGVlcg==
  endpoint: 203.0.113.7:51820
  latest handshake: 7 minutes, 2 seconds ago
  transfer: 1.20 MiB received, 300.00 KiB sent
";

pub const REPORT_REJECTED: &str = "\
interface: wg0
  public key: aGVsbG8=

peer: cGVlcg==
  endpoint: 203.0.113.7:51820
  transfer: 0 B received, 2.50 KiB sent
";

/// Tunnel whose interface appears on bring-up unless told otherwise.
pub struct FakeTunnel {
    present: AtomicBool,
    bring_up_works: AtomicBool,
    show_works: AtomicBool,
    report: Mutex<String>,
    counters: Mutex<Option<InterfaceCounters>>,
    calls: Mutex<Vec<String>>,
}

impl FakeTunnel {
    pub fn new(report: &str) -> Arc<Self> {
        Arc::new(Self {
            present: AtomicBool::new(false),
            bring_up_works: AtomicBool::new(true),
            show_works: AtomicBool::new(true),
            report: Mutex::new(report.to_string()),
            counters: Mutex::new(Some(InterfaceCounters::default())),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn set_bring_up_works(&self, works: bool) {
        self.bring_up_works.store(works, Ordering::SeqCst);
    }

    /// Make introspection fail as if `wg` were unusable.
    pub fn set_show_works(&self, works: bool) {
        self.show_works.store(works, Ordering::SeqCst);
    }

    pub fn set_report(&self, report: &str) {
        *self.report.lock().unwrap() = report.to_string();
    }

    pub fn set_rx_bytes(&self, rx_bytes: u64) {
        *self.counters.lock().unwrap() = Some(InterfaceCounters {
            rx_bytes,
            tx_bytes: 0,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelFacility for FakeTunnel {
    async fn bring_up(&self, _config: &Path) -> FacilityResult<()> {
        self.calls.lock().unwrap().push("up".into());
        let works = self.bring_up_works.load(Ordering::SeqCst);
        self.present.store(works, Ordering::SeqCst);
        Ok(())
    }

    async fn tear_down(&self, _config: &Path) -> FacilityResult<()> {
        self.calls.lock().unwrap().push("down".into());
        self.present.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn interface_exists(&self, _interface: &str) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    async fn show(&self, _interface: &str) -> FacilityResult<String> {
        if !self.show_works.load(Ordering::SeqCst) {
            return Err(FacilityError::PermissionDenied("wg show wg0".into()));
        }
        Ok(self.report.lock().unwrap().clone())
    }

    async fn counters(&self, _interface: &str) -> FacilityResult<Option<InterfaceCounters>> {
        if !self.present.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(*self.counters.lock().unwrap())
    }

    async fn interface_mtu(&self, _interface: &str) -> FacilityResult<Option<u32>> {
        Ok(Some(1500))
    }
}

/// Firewall that records every operation and keeps the rule set in memory.
#[derive(Default)]
pub struct FakeFirewall {
    log: Mutex<Vec<String>>,
    rules: Mutex<HashSet<FirewallRule>>,
    policies: Mutex<Vec<(IpFamily, ChainPolicy)>>,
    resolver: Mutex<String>,
}

impl FakeFirewall {
    pub fn new() -> Arc<Self> {
        let firewall = Self::default();
        *firewall.resolver.lock().unwrap() = "nameserver 8.8.8.8\n".to_string();
        Arc::new(firewall)
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn rules(&self) -> HashSet<FirewallRule> {
        self.rules.lock().unwrap().clone()
    }

    /// The most recent policy set for `family`.
    pub fn policy(&self, family: IpFamily) -> Option<ChainPolicy> {
        self.policies
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(f, _)| *f == family)
            .map(|(_, p)| *p)
    }

    pub fn resolver(&self) -> String {
        self.resolver.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirewallFacility for FakeFirewall {
    async fn rule_exists(&self, rule: &FirewallRule) -> FacilityResult<bool> {
        self.record(format!("check {}", rule));
        Ok(self.rules.lock().unwrap().contains(rule))
    }

    async fn insert_rule(&self, rule: &FirewallRule) -> FacilityResult<()> {
        self.record(format!("insert {}", rule));
        self.rules.lock().unwrap().insert(rule.clone());
        Ok(())
    }

    async fn append_rule(&self, rule: &FirewallRule) -> FacilityResult<()> {
        self.record(format!("append {}", rule));
        self.rules.lock().unwrap().insert(rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> FacilityResult<()> {
        self.record(format!("delete {}", rule));
        self.rules.lock().unwrap().remove(rule);
        Ok(())
    }

    async fn set_output_policy(
        &self,
        family: IpFamily,
        policy: ChainPolicy,
    ) -> FacilityResult<()> {
        self.record(format!("policy {:?} {}", family, policy.as_str()));
        self.policies.lock().unwrap().push((family, policy));
        Ok(())
    }

    async fn default_route(&self) -> FacilityResult<Option<DefaultRoute>> {
        self.record("default-route".into());
        Ok(Some(DefaultRoute {
            gateway: "172.17.0.1".parse().map_err(|_| FacilityError::Parse("gw".into()))?,
            device: "eth0".into(),
        }))
    }

    async fn add_route(&self, destination: &IpNet, _via: &DefaultRoute) -> FacilityResult<()> {
        self.record(format!("route add {}", destination));
        Ok(())
    }

    async fn delete_route(&self, destination: &IpNet) -> FacilityResult<()> {
        self.record(format!("route del {}", destination));
        Ok(())
    }

    async fn read_resolver(&self, _path: &Path) -> FacilityResult<String> {
        Ok(self.resolver())
    }

    async fn write_resolver(&self, _path: &Path, contents: &str) -> FacilityResult<()> {
        self.record("resolver write".into());
        *self.resolver.lock().unwrap() = contents.to_string();
        Ok(())
    }
}

/// Process table where programs listed as crashing exit right after launch.
#[derive(Default)]
pub struct FakeProcesses {
    next_pid: AtomicU32,
    running: Mutex<HashSet<u32>>,
    crashing: Mutex<HashSet<String>>,
    spawned: Mutex<Vec<(u32, String)>>,
    terminated: Mutex<Vec<u32>>,
    workers: AtomicU32,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        let processes = Self::default();
        processes.next_pid.store(100, Ordering::SeqCst);
        Arc::new(processes)
    }

    pub fn crash_on_start(&self, program: &str) {
        self.crashing.lock().unwrap().insert(program.to_string());
    }

    /// Simulate a child dying on its own.
    pub fn kill(&self, program: &str) {
        let spawned = self.spawned.lock().unwrap();
        let mut running = self.running.lock().unwrap();
        for (pid, name) in spawned.iter() {
            if name == program {
                running.remove(pid);
            }
        }
    }

    /// Worker processes reported by the process table scan.
    pub fn set_workers(&self, count: u32) {
        self.workers.store(count, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<(u32, String)> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessFacility for FakeProcesses {
    async fn spawn(&self, program: &str, _args: &[String]) -> FacilityResult<u32> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawned
            .lock()
            .unwrap()
            .push((pid, program.to_string()));
        if !self.crashing.lock().unwrap().contains(program) {
            self.running.lock().unwrap().insert(pid);
        }
        Ok(pid)
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.running.lock().unwrap().contains(&pid)
    }

    async fn terminate(&self, pid: u32, _timeout: Duration) -> FacilityResult<()> {
        self.running.lock().unwrap().remove(&pid);
        self.terminated.lock().unwrap().push(pid);
        Ok(())
    }

    async fn count_processes(&self, _name: &str, _roles: &[&str]) -> FacilityResult<usize> {
        Ok(self.workers.load(Ordering::SeqCst) as usize)
    }
}

pub struct Harness {
    pub tunnel: Arc<FakeTunnel>,
    pub firewall: Arc<FakeFirewall>,
    pub processes: Arc<FakeProcesses>,
}

impl Harness {
    pub fn new(report: &str) -> Self {
        Self {
            tunnel: FakeTunnel::new(report),
            firewall: FakeFirewall::new(),
            processes: FakeProcesses::new(),
        }
    }

    pub fn facilities(&self) -> Facilities {
        Facilities {
            firewall: self.firewall.clone(),
            tunnel: self.tunnel.clone(),
            processes: self.processes.clone(),
        }
    }
}

/// Write the tunnel config into `dir` and return a config pointing at it
/// with the proxy and both HTTP surfaces off.
pub fn sidecar_config(dir: &Path) -> SidecarConfig {
    let conf = dir.join("wg0.conf");
    std::fs::write(&conf, TUNNEL_CONF).unwrap();

    let mut config = SidecarConfig::default();
    config.tunnel.config_path = conf;
    config.tunnel.writable_dir = dir.join("run");
    config.policy.resolv_conf_path = dir.join("resolv.conf");
    config.proxy.enabled = false;
    config.proxy.log_path = dir.join("dante.log");
    config.health.enabled = false;
    config.metrics.enabled = false;
    config
}

pub fn missing_config(dir: &Path) -> SidecarConfig {
    let mut config = sidecar_config(dir);
    config.tunnel.config_path = dir.join("absent").join("wg0.conf");
    config
}
