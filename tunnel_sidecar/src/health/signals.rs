//! Signal extraction from the tunnel introspection report.
//!
//! The report is the human-readable output of `wg show <interface>`:
//!
//! ```text
//! peer: 3pLq...=
//!   endpoint: 198.51.100.7:51820
//!   latest handshake: 1 minute, 23 seconds ago
//!   transfer: 1.46 KiB received, 8.20 KiB sent
//! ```
//!
//! Keeping the parsing here lets the verdict logic work on typed values.

use std::fmt;
use std::time::Duration;

/// Age of the latest handshake as reported, component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeAge {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl HandshakeAge {
    pub fn total_minutes(&self) -> u64 {
        self.days * 24 * 60 + self.hours * 60 + self.minutes
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.total_minutes() * 60 + self.seconds)
    }
}

impl fmt::Display for HandshakeAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (value, unit) in [
            (self.days, "day"),
            (self.hours, "hour"),
            (self.minutes, "minute"),
            (self.seconds, "second"),
        ] {
            if value > 0 {
                let plural = if value == 1 { "" } else { "s" };
                parts.push(format!("{} {}{}", value, unit, plural));
            }
        }
        if parts.is_empty() {
            write!(f, "just now")
        } else {
            write!(f, "{} ago", parts.join(", "))
        }
    }
}

/// Cumulative traffic with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteCounters {
    pub received: u64,
    pub sent: u64,
}

/// Whether the report lists at least one peer.
pub fn has_peer(raw: &str) -> bool {
    raw.lines().any(|l| l.trim_start().starts_with("peer:"))
}

/// Parse the `latest handshake:` line. `None` when no handshake happened yet.
pub fn parse_handshake_age(raw: &str) -> Option<HandshakeAge> {
    let value = raw
        .lines()
        .find_map(|l| l.trim().strip_prefix("latest handshake:"))?
        .trim();

    if value.eq_ignore_ascii_case("now") {
        return Some(HandshakeAge::default());
    }

    let value = value.strip_suffix("ago").unwrap_or(value).trim();
    let mut age = HandshakeAge::default();
    let mut matched = false;

    for part in value.split(',') {
        let mut tokens = part.split_whitespace();
        let (Some(amount), Some(unit)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        let Ok(amount) = amount.parse::<u64>() else {
            continue;
        };
        let slot = match unit.trim_end_matches('s') {
            "day" => &mut age.days,
            "hour" => &mut age.hours,
            "minute" => &mut age.minutes,
            "second" => &mut age.seconds,
            _ => continue,
        };
        *slot = amount;
        matched = true;
    }

    matched.then_some(age)
}

/// Parse the `transfer:` lines, summed over peers.
pub fn parse_byte_counters(raw: &str) -> Option<ByteCounters> {
    let mut total: Option<ByteCounters> = None;

    for line in raw.lines() {
        let Some(value) = line.trim().strip_prefix("transfer:") else {
            continue;
        };
        let mut counters = ByteCounters::default();
        for part in value.split(',') {
            let tokens: Vec<&str> = part.split_whitespace().collect();
            let &[amount, unit, direction] = tokens.as_slice() else {
                continue;
            };
            let Some(bytes) = scale_bytes(amount, unit) else {
                continue;
            };
            match direction {
                "received" => counters.received = bytes,
                "sent" => counters.sent = bytes,
                _ => {}
            }
        }
        let acc = total.get_or_insert_with(ByteCounters::default);
        acc.received += counters.received;
        acc.sent += counters.sent;
    }

    total
}

fn scale_bytes(amount: &str, unit: &str) -> Option<u64> {
    let amount: f64 = amount.parse().ok()?;
    let factor: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((amount * factor).round() as u64)
}
