//! Top-level orchestration of the sidecar.
//!
//! Startup runs strictly in order: tunnel config, bypass routes, tunnel
//! bring-up (with the handshake exception), lockdown, DNS, initial
//! validation, proxy children, HTTP surfaces and probes. The steady-state
//! loop then watches the tunnel and the children until shutdown, which
//! unwinds everything in reverse with a bounded wait per step.

use crate::error::{SidecarError, SidecarResult};
use crate::facility::{FirewallFacility, LinuxFacility, ProcessFacility, TunnelFacility};
use crate::health::{HealthEvaluator, HealthStatus, HealthThresholds};
use crate::http::{self, HealthEndpoint, MetricsEndpoint};
use crate::metrics::{MetricRegistry, MetricsEngine, MetricsSources, ProbeTransport, SocksTransport};
use crate::policy::PolicyApplier;
use crate::supervisor::{ChildSpec, ProcessSupervisor};
use crate::tunnel::TunnelController;
use shared_utils::SidecarConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound on each shutdown step.
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// The host facilities the sidecar drives.
#[derive(Clone)]
pub struct Facilities {
    pub firewall: Arc<dyn FirewallFacility>,
    pub tunnel: Arc<dyn TunnelFacility>,
    pub processes: Arc<dyn ProcessFacility>,
}

impl Facilities {
    pub fn linux() -> Self {
        let linux = Arc::new(LinuxFacility::new());
        Self {
            firewall: linux.clone(),
            tunnel: linux.clone(),
            processes: linux,
        }
    }
}

pub struct Sidecar {
    config: SidecarConfig,
    facilities: Facilities,
    policy: Arc<PolicyApplier>,
    controller: TunnelController,
    evaluator: Arc<HealthEvaluator>,
    supervisor: ProcessSupervisor,
    probe_transport: Option<Arc<dyn ProbeTransport>>,
    servers: Vec<(&'static str, JoinHandle<SidecarResult<()>>)>,
    background: Vec<JoinHandle<()>>,
    server_shutdown: CancellationToken,
    probe_shutdown: CancellationToken,
}

impl Sidecar {
    pub fn new(config: SidecarConfig, facilities: Facilities) -> Self {
        let policy = Arc::new(PolicyApplier::new(
            facilities.firewall.clone(),
            config.policy.clone(),
        ));
        let controller = TunnelController::new(
            facilities.tunnel.clone(),
            policy.clone(),
            config.tunnel.clone(),
        );
        let evaluator = Arc::new(HealthEvaluator::new(
            facilities.tunnel.clone(),
            config.tunnel.interface.clone(),
            HealthThresholds::from(&config.health),
        ));
        let supervisor = ProcessSupervisor::from_config(facilities.processes.clone(), &config.proxy);

        Self {
            config,
            facilities,
            policy,
            controller,
            evaluator,
            supervisor,
            probe_transport: None,
            servers: Vec::new(),
            background: Vec::new(),
            server_shutdown: CancellationToken::new(),
            probe_shutdown: CancellationToken::new(),
        }
    }

    /// Use a specific transport for the active probes instead of the SOCKS5 client.
    pub fn with_probe_transport(mut self, transport: Arc<dyn ProbeTransport>) -> Self {
        self.probe_transport = Some(transport);
        self
    }

    pub fn controller(&self) -> &TunnelController {
        &self.controller
    }

    pub fn evaluator(&self) -> Arc<HealthEvaluator> {
        self.evaluator.clone()
    }

    /// Run until `shutdown` fires or a fatal condition occurs, then clean up.
    ///
    /// Returns `Ok(())` only for a requested shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) -> SidecarResult<()> {
        let started = tokio::select! {
            started = self.startup() => Some(started),
            _ = shutdown.cancelled() => None,
        };
        let result = match started {
            Some(Ok(())) => self.supervise(&shutdown).await,
            Some(Err(e)) => Err(e),
            None => {
                info!("Shutdown requested during startup");
                Ok(())
            }
        };

        if let Err(e) = &result {
            error!("Fatal: {}", e);
        }
        self.shutdown().await;
        result
    }

    async fn startup(&mut self) -> SidecarResult<()> {
        // Nothing touches the network before the tunnel config is known good
        self.controller.prepare().await?;

        self.policy.apply_bypass_routes().await;
        self.controller.start().await?;
        self.policy.lockdown(&self.config.tunnel.interface).await;
        let dns: Vec<String> = self
            .controller
            .config_file()
            .map(|f| f.dns().to_vec())
            .unwrap_or_default();
        self.policy.rewrite_dns(&dns).await;

        let degraded = self.policy.degraded();
        if !degraded.is_empty() {
            warn!(
                "Running with reduced leak protection: {}",
                degraded.join("; ")
            );
        }

        let verdict = self.evaluator.evaluate().await;
        if !verdict.is_healthy() {
            return Err(SidecarError::ValidationFailed(verdict.reason));
        }
        info!("Initial validation passed: {}", verdict.reason);

        if self.config.proxy.enabled {
            self.supervisor
                .start(ChildSpec::socks5(&self.config.proxy))
                .await?;
            if self.config.proxy.http_enabled {
                self.supervisor
                    .start(ChildSpec::http_proxy(&self.config.proxy))
                    .await?;
            }
        } else {
            info!("Proxy mode disabled");
        }

        self.start_health_server().await?;
        self.start_metrics().await;

        info!("Sidecar ready");
        Ok(())
    }

    async fn start_health_server(&mut self) -> SidecarResult<()> {
        if !self.config.health.enabled {
            info!("Health endpoint disabled");
            return Ok(());
        }
        let listener = http::bind(&self.config.health.bind_address, self.config.health.port).await?;
        let endpoint = Arc::new(HealthEndpoint::new(self.evaluator.clone()));
        let token = self.server_shutdown.clone();
        self.servers.push((
            "health",
            tokio::spawn(http::serve(listener, endpoint, token)),
        ));
        Ok(())
    }

    /// Metrics are best-effort: any failure here only loses the metrics.
    async fn start_metrics(&mut self) {
        if !self.config.metrics.enabled {
            info!("Metrics disabled");
            return;
        }

        let identity = self.config.proxy.identity();
        let registry = match MetricRegistry::new(&identity, self.config.metrics.duration_window) {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                warn!("Metrics unavailable: {}", e);
                return;
            }
        };

        let transport = match &self.probe_transport {
            Some(transport) => Some(transport.clone()),
            None => match SocksTransport::new(
                self.config.proxy.socks5_port,
                self.config.metrics.probe_timeout(),
            ) {
                Ok(t) => Some(Arc::new(t) as Arc<dyn ProbeTransport>),
                Err(e) => {
                    warn!("Active probes unavailable: {}", e);
                    None
                }
            },
        };
        let with_probes = self.config.proxy.enabled && self.supervisor.is_active("socks5");

        let engine = Arc::new(MetricsEngine::new(
            registry,
            self.config.metrics.clone(),
            self.config.proxy.log_path.clone(),
            MetricsSources {
                tunnel: self.facilities.tunnel.clone(),
                processes: self.facilities.processes.clone(),
                evaluator: self.evaluator.clone(),
                transport,
            },
        ));
        engine.poll_interface().await;
        self.background
            .extend(engine.spawn(with_probes, &self.probe_shutdown));

        match http::bind(&self.config.metrics.bind_address, self.config.metrics.port).await {
            Ok(listener) => {
                let endpoint = Arc::new(MetricsEndpoint::new(engine));
                let token = self.server_shutdown.clone();
                self.servers.push((
                    "metrics",
                    tokio::spawn(http::serve(listener, endpoint, token)),
                ));
            }
            Err(e) => warn!("Metrics endpoint unavailable: {}", e),
        }
    }

    /// Steady-state loop: liveness every tick, validation on its own cadence,
    /// child checks every tick.
    async fn supervise(&mut self, shutdown: &CancellationToken) -> SidecarResult<()> {
        let mut ticker = tokio::time::interval(self.config.tunnel.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_validation = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if self.controller.check_liveness().await? {
                last_validation = Instant::now();
            }

            if last_validation.elapsed() >= self.config.tunnel.validation_interval() {
                last_validation = Instant::now();
                self.validate().await?;
            }

            self.supervisor.check_children().await?;
        }
    }

    async fn validate(&mut self) -> SidecarResult<()> {
        let verdict = self.evaluator.evaluate().await;
        match verdict.status {
            HealthStatus::Stale | HealthStatus::InterfaceMissing => {
                self.controller.mark_degraded(&verdict.reason);
                self.controller.reconnect().await?;
                let after = self.evaluator.evaluate().await;
                info!("Post-reconnect validation: {} ({})", after.status, after.reason);
            }
            status if !status.is_healthy() => {
                warn!("Periodic validation: {} ({})", status, verdict.reason);
            }
            _ => info!("Periodic validation passed: {}", verdict.reason),
        }
        Ok(())
    }

    /// Reverse teardown. Every step runs regardless of earlier failures.
    async fn shutdown(&mut self) {
        info!("Shutting down");

        self.server_shutdown.cancel();
        for (name, handle) in self.servers.drain(..) {
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("{} endpoint stopped with error: {}", name, e),
                Ok(Err(e)) => warn!("{} endpoint task failed: {}", name, e),
                Err(_) => warn!("{} endpoint did not stop in time", name),
            }
        }

        self.probe_shutdown.cancel();
        for handle in self.background.drain(..) {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }

        let failures = bounded("stopping children", self.supervisor.stop_all()).await;
        for failure in failures.unwrap_or_default() {
            warn!("Child stop failure: {}", failure);
        }

        if let Some(Err(e)) = bounded("tunnel teardown", self.controller.tear_down()).await {
            warn!("Tunnel teardown failed: {}", e);
        }

        if let Some(report) = bounded("policy restore", self.policy.restore()).await {
            for failure in report.failures {
                warn!("Restore failure: {}", failure);
            }
        }

        info!("Shutdown complete");
    }
}

async fn bounded<F: Future>(step: &str, future: F) -> Option<F::Output> {
    match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, future).await {
        Ok(output) => Some(output),
        Err(_) => {
            warn!("Shutdown step '{}' timed out", step);
            None
        }
    }
}
