use super::signals::{self, ByteCounters, HandshakeAge};
use crate::facility::TunnelFacility;
use shared_utils::config::HealthConfig;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tunables of the health heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Handshakes older than this are stale
    pub stale_after_minutes: u64,
    /// Bytes sent without any reply before the peer is assumed to reject us
    pub invalid_credentials_sent_bytes: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_after_minutes: 3,
            invalid_credentials_sent_bytes: 1024,
        }
    }
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            stale_after_minutes: config.stale_after_minutes,
            invalid_credentials_sent_bytes: config.invalid_credentials_sent_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Establishing,
    Stale,
    InvalidCredentials,
    InterfaceMissing,
    NoPeer,
    /// The interface exists but its peer state could not be read
    Unobservable,
}

impl HealthStatus {
    /// Healthy and establishing tunnels pass liveness.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Establishing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Establishing => "establishing",
            HealthStatus::Stale => "stale",
            HealthStatus::InvalidCredentials => "invalid_credentials",
            HealthStatus::InterfaceMissing => "interface_missing",
            HealthStatus::NoPeer => "no_peer",
            HealthStatus::Unobservable => "unobservable",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The raw signal a verdict was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    None,
    Handshake(HandshakeAge),
    Traffic(ByteCounters),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub reason: String,
    pub signal: HealthSignal,
}

impl HealthVerdict {
    fn new(status: HealthStatus, reason: impl Into<String>, signal: HealthSignal) -> Self {
        Self {
            status,
            reason: reason.into(),
            signal,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// Introspected tunnel state at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelObservation {
    pub interface_present: bool,
    /// Introspection of an existing interface failed
    pub introspection_failed: bool,
    pub peer_present: bool,
    pub handshake: Option<HandshakeAge>,
    pub transfer: Option<ByteCounters>,
}

impl TunnelObservation {
    /// Observation of an existing interface from its introspection report.
    pub fn from_report(raw: &str) -> Self {
        Self {
            interface_present: true,
            introspection_failed: false,
            peer_present: signals::has_peer(raw),
            handshake: signals::parse_handshake_age(raw),
            transfer: signals::parse_byte_counters(raw),
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }
}

/// Judge an observation.
///
/// A handshake within `stale_after_minutes` is healthy and an older one is
/// stale; one reported in hours or days is stale whatever the threshold. Without any handshake, a peer that received more than
/// `invalid_credentials_sent_bytes` from us and never answered is taken to be
/// rejecting our key; otherwise the tunnel is still establishing.
pub fn judge(observation: &TunnelObservation, thresholds: &HealthThresholds) -> HealthVerdict {
    if !observation.interface_present {
        return HealthVerdict::new(
            HealthStatus::InterfaceMissing,
            "tunnel interface not found",
            HealthSignal::None,
        );
    }

    if observation.introspection_failed {
        return HealthVerdict::new(
            HealthStatus::Unobservable,
            "tunnel introspection failed; peer state unknown",
            HealthSignal::None,
        );
    }

    if !observation.peer_present {
        return HealthVerdict::new(HealthStatus::NoPeer, "no peer configured", HealthSignal::None);
    }

    if let Some(age) = observation.handshake {
        let signal = HealthSignal::Handshake(age);
        let stale = age.days > 0
            || age.hours > 0
            || age.total_minutes() > thresholds.stale_after_minutes;
        return if stale {
            HealthVerdict::new(
                HealthStatus::Stale,
                format!("last handshake {} is stale", age),
                signal,
            )
        } else {
            HealthVerdict::new(
                HealthStatus::Healthy,
                format!(
                    "last handshake {} (within {} minutes)",
                    age, thresholds.stale_after_minutes
                ),
                signal,
            )
        };
    }

    let traffic = observation.transfer.unwrap_or_default();
    let signal = HealthSignal::Traffic(traffic);
    if traffic.sent > thresholds.invalid_credentials_sent_bytes && traffic.received == 0 {
        HealthVerdict::new(
            HealthStatus::InvalidCredentials,
            format!(
                "no handshake after {} bytes sent and none received; check keys and endpoint",
                traffic.sent
            ),
            signal,
        )
    } else {
        HealthVerdict::new(
            HealthStatus::Establishing,
            "no handshake yet, connection establishing",
            signal,
        )
    }
}

/// Gathers the tunnel observation and judges it on every call.
pub struct HealthEvaluator {
    tunnel: Arc<dyn TunnelFacility>,
    interface: String,
    thresholds: HealthThresholds,
}

impl HealthEvaluator {
    pub fn new(
        tunnel: Arc<dyn TunnelFacility>,
        interface: impl Into<String>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            tunnel,
            interface: interface.into(),
            thresholds,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn observe(&self) -> TunnelObservation {
        if !self.tunnel.interface_exists(&self.interface).await {
            return TunnelObservation::missing();
        }
        match self.tunnel.show(&self.interface).await {
            Ok(raw) => TunnelObservation::from_report(&raw),
            Err(e) => {
                warn!(interface = %self.interface, "Tunnel introspection failed: {}", e);
                TunnelObservation {
                    interface_present: true,
                    introspection_failed: true,
                    ..Default::default()
                }
            }
        }
    }

    pub async fn evaluate(&self) -> HealthVerdict {
        let verdict = judge(&self.observe().await, &self.thresholds);
        debug!(
            interface = %self.interface,
            status = %verdict.status,
            "Health verdict: {}",
            verdict.reason
        );
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_handshake(days: u64, hours: u64, minutes: u64, seconds: u64) -> TunnelObservation {
        TunnelObservation {
            interface_present: true,
            introspection_failed: false,
            peer_present: true,
            handshake: Some(HandshakeAge {
                days,
                hours,
                minutes,
                seconds,
            }),
            transfer: None,
        }
    }

    fn without_handshake(sent: u64, received: u64) -> TunnelObservation {
        TunnelObservation {
            interface_present: true,
            introspection_failed: false,
            peer_present: true,
            handshake: None,
            transfer: Some(ByteCounters { received, sent }),
        }
    }

    #[test]
    fn test_missing_interface_and_peer() {
        let t = HealthThresholds::default();
        assert_eq!(
            judge(&TunnelObservation::missing(), &t).status,
            HealthStatus::InterfaceMissing
        );
        let no_peer = TunnelObservation {
            interface_present: true,
            ..Default::default()
        };
        let verdict = judge(&no_peer, &t);
        assert_eq!(verdict.status, HealthStatus::NoPeer);
        assert_eq!(verdict.reason, "no peer configured");
        assert!(!verdict.is_healthy());
    }

    #[test]
    fn test_handshake_age_policy() {
        let t = HealthThresholds::default();
        assert_eq!(judge(&with_handshake(0, 0, 0, 5), &t).status, HealthStatus::Healthy);
        assert_eq!(judge(&with_handshake(0, 0, 3, 59), &t).status, HealthStatus::Healthy);
        assert_eq!(judge(&with_handshake(0, 0, 4, 0), &t).status, HealthStatus::Stale);
        assert_eq!(judge(&with_handshake(0, 1, 0, 0), &t).status, HealthStatus::Stale);
        assert_eq!(judge(&with_handshake(2, 0, 0, 0), &t).status, HealthStatus::Stale);
    }

    #[test]
    fn test_asymmetric_traffic_policy() {
        let t = HealthThresholds::default();
        let verdict = judge(&without_handshake(1025, 0), &t);
        assert_eq!(verdict.status, HealthStatus::InvalidCredentials);
        assert_eq!(
            verdict.signal,
            HealthSignal::Traffic(ByteCounters {
                received: 0,
                sent: 1025
            })
        );

        assert_eq!(
            judge(&without_handshake(1024, 0), &t).status,
            HealthStatus::Establishing
        );
        assert_eq!(
            judge(&without_handshake(50_000, 92), &t).status,
            HealthStatus::Establishing
        );
        let quiet = TunnelObservation {
            transfer: None,
            ..without_handshake(0, 0)
        };
        assert!(judge(&quiet, &t).is_healthy());
    }

    #[test]
    fn test_thresholds_are_tunable() {
        let t = HealthThresholds {
            stale_after_minutes: 10,
            invalid_credentials_sent_bytes: 4096,
        };
        assert_eq!(judge(&with_handshake(0, 0, 8, 0), &t).status, HealthStatus::Healthy);
        assert_eq!(
            judge(&without_handshake(2048, 0), &t).status,
            HealthStatus::Establishing
        );
    }

    #[test]
    fn test_hours_and_days_are_stale_under_any_threshold() {
        let t = HealthThresholds {
            stale_after_minutes: 120,
            ..Default::default()
        };
        assert_eq!(judge(&with_handshake(0, 0, 90, 0), &t).status, HealthStatus::Healthy);
        assert_eq!(judge(&with_handshake(0, 1, 0, 0), &t).status, HealthStatus::Stale);
        assert_eq!(judge(&with_handshake(1, 0, 0, 0), &t).status, HealthStatus::Stale);
    }

    #[test]
    fn test_introspection_failure_is_not_a_missing_peer() {
        let blind = TunnelObservation {
            interface_present: true,
            introspection_failed: true,
            ..Default::default()
        };
        let verdict = judge(&blind, &HealthThresholds::default());
        assert_eq!(verdict.status, HealthStatus::Unobservable);
        assert!(verdict.reason.contains("introspection failed"));
        assert!(!verdict.is_healthy());
    }

    #[test]
    fn test_judge_from_report() {
        let raw = "peer: abc=\n  latest handshake: 12 seconds ago\n  transfer: 3 KiB received, 2 KiB sent\n";
        let verdict = judge(
            &TunnelObservation::from_report(raw),
            &HealthThresholds::default(),
        );
        assert_eq!(verdict.status, HealthStatus::Healthy);
        assert!(verdict.reason.contains("12 seconds ago"));
    }
}
