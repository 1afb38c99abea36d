use shared_utils::config::{BackoffMode, ConfigError, LogFormat, SidecarConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_sidecar_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_format = "json"

        [tunnel]
        config_path = "/etc/wireguard/edge.conf"
        bringup_retries = 10
        check_interval_secs = 15
        validation_interval_secs = 120

        [tunnel.reconnect]
        max_attempts = 4
        backoff = "exponential"
        max_backoff_secs = 40

        [policy]
        bypass_cidrs = ["10.96.0.0/12", "fd00::/8"]

        [proxy]
        socks5_args = ["-f", "/srv/danted.conf"]
        startup_grace_ms = 500

        [metrics]
        latency_interval_secs = 10
        duration_window = 50
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = SidecarConfig::load(file.path()).unwrap();

    assert_eq!(config.log_format, LogFormat::Json);
    assert_eq!(
        config.tunnel.config_path.to_str(),
        Some("/etc/wireguard/edge.conf")
    );
    assert_eq!(config.tunnel.bringup_retries, 10);
    assert_eq!(config.tunnel.check_interval(), Duration::from_secs(15));
    assert_eq!(config.tunnel.validation_interval(), Duration::from_secs(120));
    assert_eq!(config.tunnel.reconnect.max_attempts, 4);
    assert_eq!(config.tunnel.reconnect.backoff, BackoffMode::Exponential);
    assert_eq!(config.tunnel.reconnect.max_backoff_secs, 40);
    assert_eq!(config.policy.bypass_networks().len(), 2);
    assert_eq!(config.proxy.socks5_args, vec!["-f", "/srv/danted.conf"]);
    assert_eq!(config.proxy.startup_grace(), Duration::from_millis(500));
    assert_eq!(config.metrics.latency_interval(), Duration::from_secs(10));
    assert_eq!(config.metrics.duration_window, 50);
}

#[test]
fn test_unspecified_sections_take_defaults() {
    let config = SidecarConfig::from_toml_str("").unwrap();

    assert_eq!(config.tunnel.interface, "wg0");
    assert_eq!(config.tunnel.bringup_retries, 30);
    assert_eq!(config.tunnel.bringup_interval(), Duration::from_secs(2));
    assert_eq!(config.tunnel.reconnect.max_attempts, 1);
    assert_eq!(config.tunnel.reconnect.backoff, BackoffMode::Fixed);
    assert!(config.policy.kill_switch);
    assert!(config.policy.dns_rewrite);
    assert!(config.policy.bypass_routes);
    assert_eq!(config.health.port, 9999);
    assert_eq!(config.health.stale_after_minutes, 3);
    assert_eq!(config.metrics.port, 9090);
    assert_eq!(config.metrics.duration_window, 100);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_config_values() {
    let config = SidecarConfig::from_toml_str(
        r#"
        [policy]
        bypass_cidrs = ["10.0.0.0/33"]
    "#,
    )
    .unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidValue { ref key, .. }) if key == "policy.bypass_cidrs"
    ));

    let config = SidecarConfig::from_toml_str(
        r#"
        [health]
        port = 9090
    "#,
    )
    .unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidValue { ref key, .. }) if key == "metrics.port"
    ));

    let config = SidecarConfig::from_toml_str(
        r#"
        [tunnel.reconnect]
        max_attempts = 0
    "#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_malformed_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[tunnel\nbringup_retries = ").unwrap();

    let result = SidecarConfig::load(file.path());
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_load_nonexistent_file() {
    let result = SidecarConfig::load("/nonexistent/sidecar.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}
