//! Configuration management module for the tunnel sidecar.
//!
//! Settings come from three layers, in increasing precedence: built-in
//! defaults, an optional TOML file and environment variables. The
//! environment layer is what container orchestrators normally use, so every
//! operational toggle has an environment name.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// How the delay between reconnect attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// Same settle delay before every attempt
    #[default]
    Fixed,
    /// Settle delay doubles per attempt, capped at `max_backoff_secs`
    Exponential,
}

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Reconnect behaviour after the tunnel is lost in steady state.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    /// Attempts before the process gives up (default: 1)
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,

    /// Delay growth between attempts (default: fixed)
    #[serde(default)]
    pub backoff: BackoffMode,

    /// Upper bound for exponential backoff in seconds (default: 60)
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_reconnect_attempts() -> u32 {
    1
}

fn default_max_backoff_secs() -> u64 {
    60
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: default_reconnect_attempts(),
            backoff: BackoffMode::default(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

/// Tunnel bring-up and supervision settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Tunnel config file consumed by the tunnel tool
    #[serde(default = "default_tunnel_config_path")]
    pub config_path: PathBuf,

    /// Tunnel interface name (default: "wg0")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Directory for the writable copy of the tunnel config
    #[serde(default = "default_writable_dir")]
    pub writable_dir: PathBuf,

    /// Interface polls during bring-up (default: 30)
    #[serde(default = "default_bringup_retries")]
    pub bringup_retries: u32,

    /// Seconds between bring-up polls (default: 2)
    #[serde(default = "default_bringup_interval_secs")]
    pub bringup_interval_secs: u64,

    /// Supervision tick in seconds (default: 30)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Seconds of wall clock between periodic validations (default: 300)
    #[serde(default = "default_validation_interval_secs")]
    pub validation_interval_secs: u64,

    /// Settle delay after teardown before reconnecting (default: 5)
    #[serde(default = "default_reconnect_settle_secs")]
    pub reconnect_settle_secs: u64,

    /// Time allowed for the interface to reappear (default: 10)
    #[serde(default = "default_reconnect_wait_secs")]
    pub reconnect_wait_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_tunnel_config_path() -> PathBuf {
    PathBuf::from("/etc/wireguard/wg0.conf")
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_writable_dir() -> PathBuf {
    PathBuf::from("/tmp/wireguard")
}

fn default_bringup_retries() -> u32 {
    30
}

fn default_bringup_interval_secs() -> u64 {
    2
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_validation_interval_secs() -> u64 {
    300
}

fn default_reconnect_settle_secs() -> u64 {
    5
}

fn default_reconnect_wait_secs() -> u64 {
    10
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            config_path: default_tunnel_config_path(),
            interface: default_interface(),
            writable_dir: default_writable_dir(),
            bringup_retries: default_bringup_retries(),
            bringup_interval_secs: default_bringup_interval_secs(),
            check_interval_secs: default_check_interval_secs(),
            validation_interval_secs: default_validation_interval_secs(),
            reconnect_settle_secs: default_reconnect_settle_secs(),
            reconnect_wait_secs: default_reconnect_wait_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn bringup_interval(&self) -> Duration {
        Duration::from_secs(self.bringup_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.validation_interval_secs)
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_secs(self.reconnect_settle_secs)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }
}

/// Egress policy toggles. Each guarantee can be relaxed independently.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Default-deny egress outside the tunnel (default: true)
    #[serde(default = "default_true")]
    pub kill_switch: bool,

    /// Point the resolver at the tunnel DNS servers (default: true)
    #[serde(default = "default_true")]
    pub dns_rewrite: bool,

    /// Keep cluster/internal ranges reachable outside the tunnel (default: true)
    #[serde(default = "default_true")]
    pub bypass_routes: bool,

    /// Ranges routed via the original gateway when bypass routes are enabled
    #[serde(default = "default_bypass_cidrs")]
    pub bypass_cidrs: Vec<String>,

    /// Resolver file rewritten by DNS rewrite
    #[serde(default = "default_resolv_conf_path")]
    pub resolv_conf_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_bypass_cidrs() -> Vec<String> {
    vec![
        "10.0.0.0/8".to_string(),
        "172.16.0.0/12".to_string(),
        "192.168.0.0/16".to_string(),
    ]
}

fn default_resolv_conf_path() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            kill_switch: true,
            dns_rewrite: true,
            bypass_routes: true,
            bypass_cidrs: default_bypass_cidrs(),
            resolv_conf_path: default_resolv_conf_path(),
        }
    }
}

impl PolicyConfig {
    /// Parsed bypass ranges. Only valid after [`SidecarConfig::validate`].
    pub fn bypass_networks(&self) -> Vec<IpNet> {
        self.bypass_cidrs
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect()
    }
}

/// Proxy daemons supervised by the sidecar.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Run the proxy daemons at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Identity label on every metric (default: host name)
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_socks5_port")]
    pub socks5_port: u16,

    #[serde(default = "default_socks5_program")]
    pub socks5_program: String,

    #[serde(default = "default_socks5_args")]
    pub socks5_args: Vec<String>,

    /// HTTP proxy is best-effort (default: true)
    #[serde(default = "default_true")]
    pub http_enabled: bool,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_http_program")]
    pub http_program: String,

    #[serde(default = "default_http_args")]
    pub http_args: Vec<String>,

    /// Log file of the SOCKS5 daemon, tailed for session tracking
    #[serde(default = "default_proxy_log_path")]
    pub log_path: PathBuf,

    /// Grace period before checking a freshly started child (default: 2000)
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Bound on waiting for a child to exit after SIGTERM (default: 5)
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_socks5_port() -> u16 {
    1080
}

fn default_socks5_program() -> String {
    "danted".to_string()
}

fn default_socks5_args() -> Vec<String> {
    vec!["-f".to_string(), "/etc/danted.conf".to_string()]
}

fn default_http_port() -> u16 {
    8118
}

fn default_http_program() -> String {
    "tinyproxy".to_string()
}

fn default_http_args() -> Vec<String> {
    vec![
        "-d".to_string(),
        "-c".to_string(),
        "/etc/tinyproxy/tinyproxy.conf".to_string(),
    ]
}

fn default_proxy_log_path() -> PathBuf {
    PathBuf::from("/var/log/danted.log")
}

fn default_startup_grace_ms() -> u64 {
    2000
}

fn default_stop_timeout_secs() -> u64 {
    5
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            enabled: true,
            name: None,
            socks5_port: default_socks5_port(),
            socks5_program: default_socks5_program(),
            socks5_args: default_socks5_args(),
            http_enabled: true,
            http_port: default_http_port(),
            http_program: default_http_program(),
            http_args: default_http_args(),
            log_path: default_proxy_log_path(),
            startup_grace_ms: default_startup_grace_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl ProxyConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Identity label: configured name, else host name, else "vpn-proxy".
    pub fn identity(&self) -> String {
        if let Some(name) = self.name.as_ref().filter(|n| !n.trim().is_empty()) {
            return name.clone();
        }
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "vpn-proxy".to_string())
    }
}

/// Liveness endpoint and health heuristics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Serve the liveness endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_health_port")]
    pub port: u16,

    /// Handshakes older than this many minutes are stale (default: 3)
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: u64,

    /// Bytes sent without any reply before credentials are suspect (default: 1024)
    #[serde(default = "default_invalid_credentials_sent_bytes")]
    pub invalid_credentials_sent_bytes: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    9999
}

fn default_stale_after_minutes() -> u64 {
    3
}

fn default_invalid_credentials_sent_bytes() -> u64 {
    1024
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_health_port(),
            stale_after_minutes: default_stale_after_minutes(),
            invalid_credentials_sent_bytes: default_invalid_credentials_sent_bytes(),
        }
    }
}

/// Metrics endpoint and active probes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Endpoint fetched through the proxy by the latency probe
    #[serde(default = "default_latency_url")]
    pub latency_url: String,

    /// Fixed-size payload fetched through the proxy by the throughput probe
    #[serde(default = "default_throughput_url")]
    pub throughput_url: String,

    #[serde(default = "default_throughput_bytes")]
    pub throughput_bytes: u64,

    #[serde(default = "default_latency_interval_secs")]
    pub latency_interval_secs: u64,

    #[serde(default = "default_throughput_interval_secs")]
    pub throughput_interval_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Capacity of the connection duration window (default: 100)
    #[serde(default = "default_duration_window")]
    pub duration_window: usize,
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_latency_url() -> String {
    "https://cloudflare.com/cdn-cgi/trace".to_string()
}

fn default_throughput_url() -> String {
    "https://speed.cloudflare.com/__down?bytes=1000000".to_string()
}

fn default_throughput_bytes() -> u64 {
    1_000_000
}

fn default_latency_interval_secs() -> u64 {
    30
}

fn default_throughput_interval_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_duration_window() -> usize {
    100
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_metrics_port(),
            latency_url: default_latency_url(),
            throughput_url: default_throughput_url(),
            throughput_bytes: default_throughput_bytes(),
            latency_interval_secs: default_latency_interval_secs(),
            throughput_interval_secs: default_throughput_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            duration_window: default_duration_window(),
        }
    }
}

impl MetricsConfig {
    pub fn latency_interval(&self) -> Duration {
        Duration::from_secs(self.latency_interval_secs)
    }

    pub fn throughput_interval(&self) -> Duration {
        Duration::from_secs(self.throughput_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Main configuration structure for the sidecar.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SidecarConfig {
    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Also write daily-rolling log files here when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SidecarConfig {
    fn default() -> Self {
        SidecarConfig {
            tunnel: TunnelConfig::default(),
            policy: PolicyConfig::default(),
            proxy: ProxyConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_dir: None,
        }
    }
}

impl SidecarConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = SidecarConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.interface.trim().is_empty() {
            return Err(ConfigError::invalid(
                "tunnel.interface",
                "interface name cannot be empty",
            ));
        }
        if self.tunnel.bringup_retries == 0 {
            return Err(ConfigError::invalid(
                "tunnel.bringup_retries",
                "must be greater than 0",
            ));
        }
        for (key, value) in [
            ("tunnel.bringup_interval_secs", self.tunnel.bringup_interval_secs),
            ("tunnel.check_interval_secs", self.tunnel.check_interval_secs),
            (
                "tunnel.validation_interval_secs",
                self.tunnel.validation_interval_secs,
            ),
            ("metrics.latency_interval_secs", self.metrics.latency_interval_secs),
            (
                "metrics.throughput_interval_secs",
                self.metrics.throughput_interval_secs,
            ),
            ("metrics.probe_timeout_secs", self.metrics.probe_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than 0"));
            }
        }
        if self.tunnel.reconnect.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "tunnel.reconnect.max_attempts",
                "must be greater than 0",
            ));
        }
        if self.metrics.duration_window == 0 {
            return Err(ConfigError::invalid(
                "metrics.duration_window",
                "must be greater than 0",
            ));
        }
        if self.metrics.throughput_bytes == 0 {
            return Err(ConfigError::invalid(
                "metrics.throughput_bytes",
                "must be greater than 0",
            ));
        }

        for cidr in &self.policy.bypass_cidrs {
            if cidr.parse::<IpNet>().is_err() {
                return Err(ConfigError::invalid(
                    "policy.bypass_cidrs",
                    format!("'{}' is not a valid CIDR", cidr),
                ));
            }
        }

        let mut ports: Vec<(&str, u16)> = Vec::new();
        if self.health.enabled {
            ports.push(("health.port", self.health.port));
        }
        if self.metrics.enabled {
            ports.push(("metrics.port", self.metrics.port));
        }
        if self.proxy.enabled {
            ports.push(("proxy.socks5_port", self.proxy.socks5_port));
            if self.proxy.http_enabled {
                ports.push(("proxy.http_port", self.proxy.http_port));
            }
        }
        for (idx, (key, port)) in ports.iter().enumerate() {
            if *port == 0 {
                return Err(ConfigError::invalid(key, "port must be non-zero"));
            }
            if let Some((other, _)) = ports[..idx].iter().find(|(_, p)| p == port) {
                return Err(ConfigError::invalid(
                    key,
                    format!("port {} already used by {}", port, other),
                ));
            }
        }

        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Recognised keys:
    /// - KILL_SWITCH, DNS_REWRITE, BYPASS_ROUTES, BYPASS_CIDRS
    /// - HEALTH_CHECK, HEALTH_PORT, HANDSHAKE_STALE_MINUTES, INVALID_CREDENTIALS_SENT_BYTES
    /// - PROXY_MODE, PROXY_NAME, SOCKS5_PORT, HTTP_PROXY_ENABLED, HTTP_PROXY_PORT, DANTE_LOG_PATH
    /// - METRICS_ENABLED, METRICS_PORT
    /// - WG_CONFIG, WG_INTERFACE, RECONNECT_MAX_ATTEMPTS, RECONNECT_BACKOFF
    /// - DEBUG, LOG_LEVEL, LOG_FORMAT, LOG_DIR
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "on" => Some(true),
                "false" | "0" | "no" | "n" | "off" => Some(false),
                _ => None,
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }

        let flag = |key: &str, target: &mut bool| {
            if let Some(b) = lookup(key).as_deref().and_then(parse_bool) {
                *target = b;
            }
        };

        // Policy
        flag("KILL_SWITCH", &mut self.policy.kill_switch);
        flag("DNS_REWRITE", &mut self.policy.dns_rewrite);
        flag("BYPASS_ROUTES", &mut self.policy.bypass_routes);
        if let Some(v) = lookup("BYPASS_CIDRS") {
            let list = split_csv(&v);
            if !list.is_empty() {
                self.policy.bypass_cidrs = list;
            }
        }

        // Health
        flag("HEALTH_CHECK", &mut self.health.enabled);
        if let Some(n) = lookup("HEALTH_PORT").and_then(|v| v.trim().parse().ok()) {
            self.health.port = n;
        }
        if let Some(n) = lookup("HANDSHAKE_STALE_MINUTES").and_then(|v| v.trim().parse().ok()) {
            self.health.stale_after_minutes = n;
        }
        if let Some(n) =
            lookup("INVALID_CREDENTIALS_SENT_BYTES").and_then(|v| v.trim().parse().ok())
        {
            self.health.invalid_credentials_sent_bytes = n;
        }

        // Proxy
        flag("PROXY_MODE", &mut self.proxy.enabled);
        if let Some(v) = lookup("PROXY_NAME") {
            if !v.trim().is_empty() {
                self.proxy.name = Some(v.trim().to_string());
            }
        }
        if let Some(n) = lookup("SOCKS5_PORT").and_then(|v| v.trim().parse().ok()) {
            self.proxy.socks5_port = n;
        }
        flag("HTTP_PROXY_ENABLED", &mut self.proxy.http_enabled);
        if let Some(n) = lookup("HTTP_PROXY_PORT").and_then(|v| v.trim().parse().ok()) {
            self.proxy.http_port = n;
        }
        if let Some(v) = lookup("DANTE_LOG_PATH") {
            if !v.is_empty() {
                self.proxy.log_path = PathBuf::from(v);
            }
        }

        // Metrics
        flag("METRICS_ENABLED", &mut self.metrics.enabled);
        if let Some(n) = lookup("METRICS_PORT").and_then(|v| v.trim().parse().ok()) {
            self.metrics.port = n;
        }

        // Tunnel
        if let Some(v) = lookup("WG_CONFIG") {
            if !v.is_empty() {
                self.tunnel.config_path = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("WG_INTERFACE") {
            if !v.trim().is_empty() {
                self.tunnel.interface = v.trim().to_string();
            }
        }
        if let Some(n) = lookup("RECONNECT_MAX_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.tunnel.reconnect.max_attempts = n;
        }
        if let Some(v) = lookup("RECONNECT_BACKOFF") {
            self.tunnel.reconnect.backoff = match v.trim().to_ascii_lowercase().as_str() {
                "exponential" => BackoffMode::Exponential,
                "fixed" => BackoffMode::Fixed,
                _ => self.tunnel.reconnect.backoff,
            };
        }

        // Logging
        if let Some(v) = lookup("LOG_LEVEL") {
            if !v.trim().is_empty() {
                self.log_level = v.trim().to_ascii_lowercase();
            }
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.log_format = match v.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => self.log_format,
            };
        }
        if let Some(v) = lookup("LOG_DIR") {
            if !v.trim().is_empty() {
                self.log_dir = Some(PathBuf::from(v.trim()));
            }
        }
        if lookup("DEBUG").as_deref().and_then(parse_bool) == Some(true) {
            self.log_level = "debug".to_string();
        }
    }
}
