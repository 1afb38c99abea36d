//! Active latency and throughput probes through the local SOCKS5 proxy.

use super::registry::MetricRegistry;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Short body: expected {expected} bytes, got {received}")]
    ShortBody { expected: u64, received: u64 },

    #[error("Probe client setup failed: {0}")]
    Client(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(e: reqwest::Error) -> Self {
        ProbeError::Request(e.to_string())
    }
}

/// A completed GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Issues probe requests. The production transport goes through the proxy.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<ProbeResponse, ProbeError>;
}

/// HTTP client routed through the local SOCKS5 daemon.
pub struct SocksTransport {
    client: reqwest::Client,
}

impl SocksTransport {
    pub fn new(socks_port: u16, timeout: Duration) -> Result<Self, ProbeError> {
        // socks5h: names are resolved on the far side of the tunnel
        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", socks_port))
            .map_err(|e| ProbeError::Client(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeTransport for SocksTransport {
    async fn get(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        Ok(ProbeResponse {
            bytes: body.len() as u64,
            elapsed: start.elapsed(),
        })
    }
}

/// Round-trip time of a small request, published in milliseconds.
pub struct LatencyProbe {
    transport: Arc<dyn ProbeTransport>,
    registry: Arc<MetricRegistry>,
    url: String,
}

impl LatencyProbe {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        registry: Arc<MetricRegistry>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            url: url.into(),
        }
    }

    /// One probe cycle. A failure counts as a failed request and leaves the
    /// previous gauge value untouched.
    pub async fn run_once(&self) -> Result<f64, ProbeError> {
        match self.transport.get(&self.url).await {
            Ok(response) => {
                let ms = response.elapsed.as_secs_f64() * 1000.0;
                self.registry.set_latency_ms(ms);
                debug!("Latency probe: {:.1} ms", ms);
                Ok(ms)
            }
            Err(e) => {
                self.registry.record_failure();
                warn!("Latency probe failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Download speed of a fixed-size payload, published in megabits/second.
pub struct ThroughputProbe {
    transport: Arc<dyn ProbeTransport>,
    registry: Arc<MetricRegistry>,
    url: String,
    expected_bytes: u64,
}

impl ThroughputProbe {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        registry: Arc<MetricRegistry>,
        url: impl Into<String>,
        expected_bytes: u64,
    ) -> Self {
        Self {
            transport,
            registry,
            url: url.into(),
            expected_bytes,
        }
    }

    pub async fn run_once(&self) -> Result<f64, ProbeError> {
        let result = self
            .transport
            .get(&self.url)
            .await
            .and_then(|response| {
                if response.bytes < self.expected_bytes {
                    return Err(ProbeError::ShortBody {
                        expected: self.expected_bytes,
                        received: response.bytes,
                    });
                }
                Ok(megabits_per_second(response.bytes, response.elapsed))
            });

        match result {
            Ok(mbps) => {
                self.registry.set_download_speed_mbps(mbps);
                debug!("Throughput probe: {:.2} Mbps", mbps);
                Ok(mbps)
            }
            Err(e) => {
                self.registry.record_failure();
                warn!("Throughput probe failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Megabits per second for `bytes` transferred in `elapsed`.
pub fn megabits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-3);
    bytes as f64 * 8.0 / secs / 1_000_000.0
}

/// Run `cycle` every `period` until `cancel` fires. The first cycle runs
/// immediately; a slow cycle delays the next one instead of bunching up.
pub async fn run_every<F, Fut>(period: Duration, cancel: CancellationToken, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = cycle() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_megabits_per_second() {
        let mbps = megabits_per_second(1_000_000, Duration::from_secs(1));
        assert!((mbps - 8.0).abs() < 1e-9);
        let mbps = megabits_per_second(1_000_000, Duration::from_millis(500));
        assert!((mbps - 16.0).abs() < 1e-9);
        assert!(megabits_per_second(1_000_000, Duration::ZERO).is_finite());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_every_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let task = {
            let cancel = cancel.clone();
            let count = count.clone();
            tokio::spawn(async move {
                run_every(Duration::from_secs(30), cancel, || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        task.await.unwrap();
        // Ticks at 0, 30, 60 and 90 seconds
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
