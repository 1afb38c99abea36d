//! The metric registry behind the metrics endpoint.
//!
//! Counters and gauges are prometheus atomics, so concurrent producers never
//! lose an update. The two pieces of state that are not single values (the
//! duration window and the recent request timestamps) each sit behind their
//! own lock. Derived gauges are recomputed when the registry is rendered.

use super::window::ConnectionDurationWindow;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Span over which the request rate is measured.
pub const REQUEST_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on remembered request timestamps.
const MAX_RATE_SAMPLES: usize = 100_000;

pub struct MetricRegistry {
    registry: Registry,
    identity: String,
    info: IntGauge,
    bytes_transferred: IntCounter,
    requests_failed: IntCounter,
    requests_successful: IntCounter,
    success_rate: Gauge,
    active_connections: IntGauge,
    request_rate: Gauge,
    latency_ms: Gauge,
    download_speed_mbps: Gauge,
    vpn_status: IntGauge,
    avg_connection_duration: Gauge,
    durations: Mutex<ConnectionDurationWindow>,
    recent_requests: Mutex<VecDeque<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MetricRegistry {
    /// Create a registry whose every family carries `proxy_name=<identity>`.
    pub fn new(identity: &str, window_capacity: usize) -> prometheus::Result<Self> {
        let labels = HashMap::from([("proxy_name".to_string(), identity.to_string())]);
        let registry = Registry::new_custom(None, Some(labels))?;

        macro_rules! register {
            ($kind:ty, $name:expr, $help:expr) => {{
                let metric = <$kind>::new($name, $help)?;
                registry.register(Box::new(metric.clone()))?;
                metric
            }};
        }

        let info = register!(IntGauge, "proxy_info", "Proxy information");
        let bytes_transferred = register!(
            IntCounter,
            "proxy_bytes_transferred_total",
            "Total bytes received through the tunnel interface"
        );
        let requests_failed = register!(
            IntCounter,
            "proxy_requests_failed_total",
            "Total failed proxy requests"
        );
        let requests_successful = register!(
            IntCounter,
            "proxy_requests_successful_total",
            "Total successful proxy requests"
        );
        let success_rate = register!(Gauge, "proxy_success_rate", "Request success rate (%)");
        let active_connections = register!(
            IntGauge,
            "proxy_active_connections",
            "Number of active connections"
        );
        let request_rate = register!(
            Gauge,
            "proxy_request_rate_permin",
            "Requests per minute"
        );
        let latency_ms = register!(
            Gauge,
            "proxy_latency_ms",
            "Round-trip latency through the proxy in milliseconds"
        );
        let download_speed_mbps = register!(
            Gauge,
            "proxy_download_speed_mbps",
            "Download speed through the proxy in Mbps"
        );
        let vpn_status = register!(
            IntGauge,
            "vpn_connection_status",
            "VPN connection status (1=connected, 0=disconnected)"
        );
        let avg_connection_duration = register!(
            Gauge,
            "proxy_avg_connection_duration_seconds",
            "Average connection duration in seconds"
        );

        info.set(1);

        Ok(Self {
            registry,
            identity: identity.to_string(),
            info,
            bytes_transferred,
            requests_failed,
            requests_successful,
            success_rate,
            active_connections,
            request_rate,
            latency_ms,
            download_speed_mbps,
            vpn_status,
            avg_connection_duration,
            durations: Mutex::new(ConnectionDurationWindow::new(window_capacity)),
            recent_requests: Mutex::new(VecDeque::new()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn add_bytes(&self, delta: u64) {
        self.bytes_transferred.inc_by(delta);
    }

    pub fn record_success(&self) {
        self.requests_successful.inc();
        self.note_request(Instant::now());
    }

    pub fn record_failure(&self) {
        self.requests_failed.inc();
        self.note_request(Instant::now());
    }

    fn note_request(&self, at: Instant) {
        let mut recent = lock(&self.recent_requests);
        if recent.len() >= MAX_RATE_SAMPLES {
            recent.pop_front();
        }
        recent.push_back(at);
    }

    pub fn record_duration(&self, seconds: f64) {
        lock(&self.durations).push(seconds);
    }

    pub fn set_active_connections(&self, count: usize) {
        self.active_connections
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn set_latency_ms(&self, ms: f64) {
        self.latency_ms.set(ms);
    }

    pub fn set_download_speed_mbps(&self, mbps: f64) {
        self.download_speed_mbps.set(mbps);
    }

    pub fn set_vpn_connected(&self, connected: bool) {
        self.vpn_status.set(i64::from(connected));
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.get()
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.get()
    }

    pub fn requests_successful(&self) -> u64 {
        self.requests_successful.get()
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms.get()
    }

    pub fn download_speed_mbps(&self) -> f64 {
        self.download_speed_mbps.get()
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    /// Successful share of all requests in percent, 0 before any request.
    pub fn success_rate(&self) -> f64 {
        success_rate(self.requests_successful(), self.requests_failed())
    }

    pub fn average_connection_duration(&self) -> f64 {
        lock(&self.durations).average()
    }

    /// Requests seen during the last minute before `now`.
    pub fn request_rate_per_minute(&self, now: Instant) -> f64 {
        let mut recent = lock(&self.recent_requests);
        while let Some(front) = recent.front() {
            if now.saturating_duration_since(*front) > REQUEST_RATE_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.len() as f64
    }

    fn refresh_derived(&self) {
        self.info.set(1);
        self.success_rate.set(self.success_rate());
        self.avg_connection_duration
            .set(self.average_connection_duration());
        self.request_rate
            .set(self.request_rate_per_minute(Instant::now()));
    }

    /// Text exposition of every family.
    pub fn render(&self) -> prometheus::Result<String> {
        self.refresh_derived();
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = String::new();
        encoder.encode_utf8(&families, &mut buffer)?;
        Ok(buffer)
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

/// `successful / (successful + failed) * 100`, 0 when both are 0.
pub fn success_rate(successful: u64, failed: u64) -> f64 {
    let total = successful.saturating_add(failed);
    if total == 0 {
        return 0.0;
    }
    successful as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_without_requests() {
        let registry = MetricRegistry::new("edge-1", 100).unwrap();
        assert_eq!(registry.success_rate(), 0.0);
        registry.record_success();
        registry.record_success();
        registry.record_success();
        registry.record_failure();
        assert_eq!(registry.success_rate(), 75.0);
    }

    #[test]
    fn test_render_contains_all_families_with_label() {
        let registry = MetricRegistry::new("edge-1", 100).unwrap();
        registry.set_vpn_connected(true);
        registry.set_latency_ms(42.5);
        registry.add_bytes(2048);
        let text = registry.render().unwrap();

        for family in [
            "proxy_info",
            "proxy_bytes_transferred_total",
            "proxy_requests_failed_total",
            "proxy_requests_successful_total",
            "proxy_success_rate",
            "proxy_active_connections",
            "proxy_request_rate_permin",
            "proxy_latency_ms",
            "proxy_download_speed_mbps",
            "vpn_connection_status",
            "proxy_avg_connection_duration_seconds",
        ] {
            assert!(
                text.contains(&format!("# TYPE {} ", family)),
                "missing {}",
                family
            );
        }
        assert!(text.contains("proxy_info{proxy_name=\"edge-1\"} 1"));
        assert!(text.contains("vpn_connection_status{proxy_name=\"edge-1\"} 1"));
        assert!(text.contains("proxy_latency_ms{proxy_name=\"edge-1\"} 42.5"));
        assert!(text.contains("proxy_bytes_transferred_total{proxy_name=\"edge-1\"} 2048"));
    }

    #[test]
    fn test_request_rate_window() {
        let registry = MetricRegistry::new("edge-1", 100).unwrap();
        let start = Instant::now();
        registry.note_request(start);
        registry.note_request(start + Duration::from_secs(30));
        registry.note_request(start + Duration::from_secs(70));

        assert_eq!(
            registry.request_rate_per_minute(start + Duration::from_secs(75)),
            2.0
        );
        assert_eq!(
            registry.request_rate_per_minute(start + Duration::from_secs(200)),
            0.0
        );
    }

    #[test]
    fn test_average_duration_from_window() {
        let registry = MetricRegistry::new("edge-1", 2).unwrap();
        assert_eq!(registry.average_connection_duration(), 0.0);
        registry.record_duration(10.0);
        registry.record_duration(20.0);
        registry.record_duration(30.0);
        assert_eq!(registry.average_connection_duration(), 25.0);
    }
}
