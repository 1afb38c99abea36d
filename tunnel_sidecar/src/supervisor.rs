//! Supervision of the proxy daemons.

use crate::error::{SidecarError, SidecarResult};
use crate::facility::ProcessFacility;
use shared_utils::config::ProxyConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Whether a child's failure takes the whole sidecar down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Required,
    BestEffort,
}

/// How to launch one supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub listen_port: u16,
    pub criticality: Criticality,
}

impl ChildSpec {
    /// The SOCKS5 daemon; the sidecar has no purpose without it.
    pub fn socks5(config: &ProxyConfig) -> Self {
        Self {
            name: "socks5".to_string(),
            program: config.socks5_program.clone(),
            args: config.socks5_args.clone(),
            listen_port: config.socks5_port,
            criticality: Criticality::Required,
        }
    }

    pub fn http_proxy(config: &ProxyConfig) -> Self {
        Self {
            name: "http-proxy".to_string(),
            program: config.http_program.clone(),
            args: config.http_args.clone(),
            listen_port: config.http_port,
            criticality: Criticality::BestEffort,
        }
    }
}

/// Result of starting a child that did not abort startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Running(u32),
    /// A best-effort child failed; its feature is unavailable
    Degraded(String),
}

#[derive(Debug)]
struct ProxyProcess {
    spec: ChildSpec,
    pid: Option<u32>,
    active: bool,
}

pub struct ProcessSupervisor {
    processes: Arc<dyn ProcessFacility>,
    grace: Duration,
    stop_timeout: Duration,
    children: Vec<ProxyProcess>,
}

impl ProcessSupervisor {
    pub fn new(
        processes: Arc<dyn ProcessFacility>,
        grace: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            processes,
            grace,
            stop_timeout,
            children: Vec::new(),
        }
    }

    pub fn from_config(processes: Arc<dyn ProcessFacility>, config: &ProxyConfig) -> Self {
        Self::new(processes, config.startup_grace(), config.stop_timeout())
    }

    fn failed(&self, spec: &ChildSpec, reason: String) -> SidecarResult<StartOutcome> {
        let name = spec.name.clone();
        match spec.criticality {
            Criticality::Required => {
                error!(child = %name, "Required child failed: {}", reason);
                Err(SidecarError::RequiredChildFailed { name, reason })
            }
            Criticality::BestEffort => {
                warn!(child = %name, "Optional child unavailable: {}", reason);
                Ok(StartOutcome::Degraded(reason))
            }
        }
    }

    /// Launch a child, wait the grace period and confirm it is still running.
    ///
    /// The child is tracked from the moment it is spawned, so `stop_all`
    /// reaches it even if this future is dropped during the grace period.
    pub async fn start(&mut self, spec: ChildSpec) -> SidecarResult<StartOutcome> {
        info!(
            child = %spec.name,
            port = spec.listen_port,
            "Starting {} {}",
            spec.program,
            spec.args.join(" ")
        );

        let pid = match self.processes.spawn(&spec.program, &spec.args).await {
            Ok(pid) => pid,
            Err(e) => {
                let outcome = self.failed(&spec, format!("failed to launch: {}", e));
                self.children.push(ProxyProcess {
                    spec,
                    pid: None,
                    active: false,
                });
                return outcome;
            }
        };

        let index = self.children.len();
        self.children.push(ProxyProcess {
            spec: spec.clone(),
            pid: Some(pid),
            active: false,
        });

        let grace = self.grace;
        tokio::time::sleep(grace).await;

        if !self.processes.is_running(pid).await {
            return self.failed(&spec, format!("exited within {:?} of launch", grace));
        }

        info!(child = %spec.name, pid, "Child running");
        if let Some(child) = self.children.get_mut(index) {
            child.active = true;
        }
        Ok(StartOutcome::Running(pid))
    }

    /// Terminate one child without waiting longer than the stop timeout.
    pub async fn stop(&mut self, name: &str) -> SidecarResult<()> {
        let Some(child) = self.children.iter_mut().find(|c| c.spec.name == name) else {
            return Ok(());
        };
        child.active = false;
        if let Some(pid) = child.pid.take() {
            info!(child = %name, pid, "Stopping child");
            self.processes.terminate(pid, self.stop_timeout).await?;
        }
        Ok(())
    }

    /// Stop every child, most recently started first. Failures are collected.
    pub async fn stop_all(&mut self) -> Vec<String> {
        let names: Vec<String> = self
            .children
            .iter()
            .rev()
            .map(|c| c.spec.name.clone())
            .collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(child = %name, "Failed to stop child: {}", e);
                failures.push(format!("{}: {}", name, e));
            }
        }
        failures
    }

    /// Notice children that exited since the last check.
    ///
    /// A required child that died is fatal; a best-effort one is marked
    /// inactive and reported once.
    pub async fn check_children(&mut self) -> SidecarResult<()> {
        for child in self.children.iter_mut().filter(|c| c.active) {
            let Some(pid) = child.pid else { continue };
            if self.processes.is_running(pid).await {
                continue;
            }
            child.active = false;
            match child.spec.criticality {
                Criticality::Required => {
                    error!(child = %child.spec.name, pid, "Required child exited");
                    return Err(SidecarError::RequiredChildFailed {
                        name: child.spec.name.clone(),
                        reason: "exited unexpectedly".to_string(),
                    });
                }
                Criticality::BestEffort => {
                    warn!(
                        child = %child.spec.name,
                        pid, "Optional child exited; feature disabled"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.children
            .iter()
            .any(|c| c.spec.name == name && c.active)
    }

    /// Specs of the children currently serving.
    pub fn active_children(&self) -> Vec<&ChildSpec> {
        self.children
            .iter()
            .filter(|c| c.active)
            .map(|c| &c.spec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_specs_from_config() {
        let config = ProxyConfig::default();
        let socks = ChildSpec::socks5(&config);
        assert_eq!(socks.criticality, Criticality::Required);
        assert_eq!(socks.listen_port, 1080);
        let http = ChildSpec::http_proxy(&config);
        assert_eq!(http.criticality, Criticality::BestEffort);
        assert_eq!(http.program, "tinyproxy");
    }
}
