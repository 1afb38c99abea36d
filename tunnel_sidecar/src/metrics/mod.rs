//! Proxy performance metrics.
//!
//! Three producers feed one [`MetricRegistry`]: the interface counter poller,
//! the active probes and the proxy log tail. The metrics endpoint reads it.

pub mod interface;
pub mod probes;
pub mod registry;
pub mod sessions;
pub mod window;

pub use interface::ByteCounterTracker;
pub use probes::{
    LatencyProbe, ProbeError, ProbeResponse, ProbeTransport, SocksTransport, ThroughputProbe,
};
pub use registry::{success_rate, MetricRegistry};
pub use sessions::{parse_line, LogEvent, SessionTracker, StreamEnd};
pub use window::ConnectionDurationWindow;

use crate::facility::{ProcessFacility, TunnelFacility};
use crate::health::HealthEvaluator;
use shared_utils::config::MetricsConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process title fragment of the SOCKS5 daemon's workers.
const PROXY_PROCESS_NAME: &str = "danted:";
const PROXY_WORKER_ROLES: [&str; 2] = ["request-child", "negotiate-child"];

/// Collaborators the engine reads from.
pub struct MetricsSources {
    pub tunnel: Arc<dyn TunnelFacility>,
    pub processes: Arc<dyn ProcessFacility>,
    pub evaluator: Arc<HealthEvaluator>,
    /// Carries the active probes; without one only passive metrics are kept
    pub transport: Option<Arc<dyn ProbeTransport>>,
}

pub struct MetricsEngine {
    registry: Arc<MetricRegistry>,
    config: MetricsConfig,
    log_path: PathBuf,
    sources: MetricsSources,
    bytes: Mutex<ByteCounterTracker>,
}

impl MetricsEngine {
    pub fn new(
        registry: Arc<MetricRegistry>,
        config: MetricsConfig,
        log_path: PathBuf,
        sources: MetricsSources,
    ) -> Self {
        Self {
            registry,
            config,
            log_path,
            sources,
            bytes: Mutex::new(ByteCounterTracker::new()),
        }
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Read the tunnel interface counters and grow the bytes counter.
    pub async fn poll_interface(&self) {
        let interface = self.sources.evaluator.interface();
        match self.sources.tunnel.counters(interface).await {
            Ok(Some(counters)) => {
                let delta = self
                    .bytes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .observe(counters.rx_bytes);
                self.registry.add_bytes(delta);
            }
            Ok(None) => debug!("Interface {} absent; counters unchanged", interface),
            Err(e) => debug!("Cannot read counters of {}: {}", interface, e),
        }
    }

    /// Update the tunnel status gauge from a fresh verdict.
    pub async fn refresh_status(&self) {
        let verdict = self.sources.evaluator.evaluate().await;
        self.registry.set_vpn_connected(verdict.is_healthy());
    }

    /// Refresh the scrape-time values and render the registry.
    pub async fn scrape(&self) -> prometheus::Result<String> {
        self.poll_interface().await;
        self.refresh_status().await;
        self.registry.render()
    }

    /// Active connections from the process table, for when the log is unavailable.
    pub async fn count_proxy_workers(&self) {
        match self
            .sources
            .processes
            .count_processes(PROXY_PROCESS_NAME, &PROXY_WORKER_ROLES)
            .await
        {
            Ok(count) => self.registry.set_active_connections(count),
            Err(e) => debug!("Process scan failed: {}", e),
        }
    }

    /// Start the background producers. Probes only run when a proxy is
    /// there to carry them.
    pub fn spawn(
        self: &Arc<Self>,
        with_probes: bool,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let engine = self.clone();
        let token = cancel.clone();
        let period = self.config.latency_interval();
        tasks.push(tokio::spawn(async move {
            probes::run_every(period, token, || {
                let engine = engine.clone();
                async move { engine.poll_interface().await }
            })
            .await;
        }));

        if !with_probes {
            info!("Proxy disabled; active probes and log tracking not started");
            return tasks;
        }

        let engine = self.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { engine.follow_log(token).await }));

        let Some(transport) = self.sources.transport.clone() else {
            warn!("No probe transport; latency and throughput stay unreported");
            return tasks;
        };

        let latency = Arc::new(LatencyProbe::new(
            transport.clone(),
            self.registry.clone(),
            self.config.latency_url.clone(),
        ));
        let token = cancel.clone();
        let period = self.config.latency_interval();
        tasks.push(tokio::spawn(async move {
            probes::run_every(period, token, || {
                let latency = latency.clone();
                async move {
                    let _ = latency.run_once().await;
                }
            })
            .await;
        }));

        let throughput = Arc::new(ThroughputProbe::new(
            transport,
            self.registry.clone(),
            self.config.throughput_url.clone(),
            self.config.throughput_bytes,
        ));
        let token = cancel.clone();
        let period = self.config.throughput_interval();
        tasks.push(tokio::spawn(async move {
            probes::run_every(period, token, || {
                let throughput = throughput.clone();
                async move {
                    let _ = throughput.run_once().await;
                }
            })
            .await;
        }));

        tasks
    }

    async fn follow_log(self: Arc<Self>, cancel: CancellationToken) {
        if !tokio::fs::try_exists(&self.log_path).await.unwrap_or(false) {
            warn!(
                "Proxy log {} not found; counting proxy workers instead",
                self.log_path.display()
            );
            return self.scan_processes(cancel).await;
        }

        let spawned = Command::new("tail")
            .args(["-F", "-n", "0"])
            .arg(&self.log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut tail = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Cannot follow proxy log: {}; counting proxy workers instead", e);
                return self.scan_processes(cancel).await;
            }
        };
        let Some(stdout) = tail.stdout.take() else {
            return self.scan_processes(cancel).await;
        };

        info!("Following proxy log {}", self.log_path.display());
        self.track_sessions(BufReader::new(stdout), cancel).await;
        let _ = tail.kill().await;
    }

    /// Track sessions from `reader`; if the stream closes before `cancel`
    /// fires, keep the active-connections gauge current from the process table.
    pub async fn track_sessions<R>(self: Arc<Self>, reader: R, cancel: CancellationToken)
    where
        R: AsyncBufRead + Unpin,
    {
        let end = SessionTracker::new(self.registry.clone())
            .run(reader, cancel.clone())
            .await;
        if end == StreamEnd::Closed && !cancel.is_cancelled() {
            warn!("Proxy log no longer readable; counting proxy workers instead");
            self.scan_processes(cancel).await;
        }
    }

    async fn scan_processes(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.latency_interval();
        probes::run_every(period, cancel, || {
            let engine = self.clone();
            async move { engine.count_proxy_workers().await }
        })
        .await;
    }
}
