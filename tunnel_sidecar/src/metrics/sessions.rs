//! Session tracking from the SOCKS5 daemon's log.
//!
//! Relevant dante lines look like:
//!
//! ```text
//! Mar  3 10:15:02 (1709460902.441312) danted[88]: info: pass(1): tcp/connect [: 10.0.0.5.51234 10.0.0.2.1080 -> 10.64.0.2.40000 93.184.216.34.443
//! Mar  3 10:15:14 (1709460914.902114) danted[88]: info: pass(1): tcp/connect ]: 1024 -> 10.0.0.5.51234 10.0.0.2.1080 -> 2048, 2048 -> 10.64.0.2.40000 93.184.216.34.443 -> 1024: local client closed.  Session duration: 12s
//! Mar  3 10:16:40 (1709461000.100000) danted[88]: info: block(1): tcp/accept ]: 10.0.0.9.5555 10.0.0.2.1080: blocked by rule #2
//! ```

use super::registry::MetricRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Open sessions remembered before the oldest is dropped.
const MAX_OPEN_SESSIONS: usize = 4096;

/// Why [`SessionTracker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Cancelled,
    /// The log stream closed or became unreadable
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    SessionOpened {
        client: String,
        at: f64,
    },
    SessionClosed {
        client: String,
        at: f64,
        /// Duration printed by the daemon, if any
        reported: Option<f64>,
    },
    Blocked {
        at: f64,
    },
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The `(epoch.fraction)` field, if present.
fn parse_timestamp(line: &str) -> Option<f64> {
    let mut rest = line;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let close = after.find(')')?;
        let inner = &after[..close];
        if inner.contains('.') {
            if let Ok(ts) = inner.parse::<f64>() {
                return Some(ts);
            }
        }
        rest = &after[close + 1..];
    }
    None
}

fn client_key(token: &str) -> String {
    let token = token.trim_end_matches([',', ':']);
    match token.rsplit_once('@') {
        Some((_, addr)) => addr.to_string(),
        None => token.to_string(),
    }
}

fn parse_reported_duration(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("Session duration:")?;
    let value = rest.split_whitespace().next()?;
    value.trim_end_matches('s').parse().ok()
}

/// Parse one log line. `arrival` stands in for a missing timestamp.
pub fn parse_line(line: &str, arrival: f64) -> Option<LogEvent> {
    let at = parse_timestamp(line).unwrap_or(arrival);

    if line.contains("block(") {
        return Some(LogEvent::Blocked { at });
    }
    if !line.contains("pass(") {
        return None;
    }

    let (_, rest) = line.split_once("tcp/connect")?;
    let mut tokens = rest.split_whitespace();
    match tokens.next()? {
        "[:" => {
            let client = client_key(tokens.next()?);
            Some(LogEvent::SessionOpened { client, at })
        }
        "]:" => {
            let client = client_key(tokens.skip_while(|t| *t != "->").nth(1)?);
            Some(LogEvent::SessionClosed {
                client,
                at,
                reported: parse_reported_duration(line),
            })
        }
        _ => None,
    }
}

/// Pairs session open/close events and feeds the registry.
pub struct SessionTracker {
    registry: Arc<MetricRegistry>,
    open: HashMap<String, f64>,
}

impl SessionTracker {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self {
            registry,
            open: HashMap::new(),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.open.len()
    }

    pub fn handle(&mut self, event: LogEvent) {
        match event {
            LogEvent::SessionOpened { client, at } => {
                self.registry.record_success();
                if self.open.len() >= MAX_OPEN_SESSIONS && !self.open.contains_key(&client) {
                    self.evict_oldest();
                }
                self.open.insert(client, at);
            }
            LogEvent::SessionClosed {
                client,
                at,
                reported,
            } => {
                let duration = match self.open.remove(&client) {
                    Some(started) => Some((at - started).max(0.0)),
                    None => reported,
                };
                if let Some(seconds) = duration {
                    self.registry.record_duration(seconds);
                }
            }
            LogEvent::Blocked { .. } => self.registry.record_failure(),
        }
        self.registry.set_active_connections(self.open.len());
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .open
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            debug!("Dropping unmatched session {}", key);
            self.open.remove(&key);
        }
    }

    /// Consume log lines until the stream ends or `cancel` fires.
    pub async fn run<R>(mut self, reader: R, cancel: CancellationToken) -> StreamEnd
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_line(&line, now_epoch()) {
                            self.handle(event);
                        }
                    }
                    Ok(None) => {
                        info!("Proxy log stream ended");
                        return StreamEnd::Closed;
                    }
                    Err(e) => {
                        warn!("Failed to read proxy log: {}", e);
                        return StreamEnd::Closed;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: &str = "Mar  3 10:15:02 (1709460902.441312) danted[88]: info: pass(1): tcp/connect [: 10.0.0.5.51234 10.0.0.2.1080 -> 10.64.0.2.40000 93.184.216.34.443";
    const CLOSE: &str = "Mar  3 10:15:14 (1709460914.441312) danted[88]: info: pass(1): tcp/connect ]: 1024 -> 10.0.0.5.51234 10.0.0.2.1080 -> 2048, 2048 -> 10.64.0.2.40000 93.184.216.34.443 -> 1024: local client closed.  Session duration: 12s";
    const BLOCK: &str = "Mar  3 10:16:40 (1709461000.100000) danted[88]: info: block(1): tcp/accept ]: 10.0.0.9.5555 10.0.0.2.1080: blocked by rule #2";

    #[test]
    fn test_parse_open_close_block() {
        assert_eq!(
            parse_line(OPEN, 0.0),
            Some(LogEvent::SessionOpened {
                client: "10.0.0.5.51234".into(),
                at: 1709460902.441312
            })
        );
        match parse_line(CLOSE, 0.0) {
            Some(LogEvent::SessionClosed {
                client, reported, ..
            }) => {
                assert_eq!(client, "10.0.0.5.51234");
                assert_eq!(reported, Some(12.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse_line(BLOCK, 0.0),
            Some(LogEvent::Blocked { .. })
        ));
        assert_eq!(parse_line("danted[88]: info: Dante/server v1.4.3 running", 0.0), None);
    }

    #[test]
    fn test_user_prefix_and_arrival_time() {
        let line = "danted[88]: info: pass(1): tcp/connect [: user%alice@10.0.0.5.40000 10.0.0.2.1080 -> 10.64.0.2.1 1.1.1.1.443";
        assert_eq!(
            parse_line(line, 99.0),
            Some(LogEvent::SessionOpened {
                client: "10.0.0.5.40000".into(),
                at: 99.0
            })
        );
    }

    #[test]
    fn test_tracker_pairs_sessions() {
        let registry = Arc::new(MetricRegistry::new("edge-1", 100).unwrap());
        let mut tracker = SessionTracker::new(registry.clone());

        tracker.handle(parse_line(OPEN, 0.0).unwrap());
        assert_eq!(registry.active_connections(), 1);
        tracker.handle(parse_line(CLOSE, 0.0).unwrap());
        tracker.handle(parse_line(BLOCK, 0.0).unwrap());

        assert_eq!(tracker.open_sessions(), 0);
        assert_eq!(registry.active_connections(), 0);
        assert_eq!(registry.requests_successful(), 1);
        assert_eq!(registry.requests_failed(), 1);
        assert!((registry.average_connection_duration() - 12.0).abs() < 1e-3);
    }

    #[test]
    fn test_close_without_open_uses_reported_duration() {
        let registry = Arc::new(MetricRegistry::new("edge-1", 100).unwrap());
        let mut tracker = SessionTracker::new(registry.clone());
        let close = CLOSE.replace("Session duration: 12s", "Session duration: 7s");
        tracker.handle(parse_line(&close, 0.0).unwrap());
        assert_eq!(registry.average_connection_duration(), 7.0);
    }

    #[tokio::test]
    async fn test_run_consumes_stream() {
        let registry = Arc::new(MetricRegistry::new("edge-1", 100).unwrap());
        let tracker = SessionTracker::new(registry.clone());
        let input = format!("{}\n{}\n{}\n", OPEN, BLOCK, CLOSE);
        let end = tracker
            .run(input.as_bytes(), CancellationToken::new())
            .await;
        assert_eq!(end, StreamEnd::Closed);
        assert_eq!(registry.requests_successful(), 1);
        assert_eq!(registry.requests_failed(), 1);
    }
}
