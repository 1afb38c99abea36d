//! Tunnel health inference.

pub mod evaluator;
pub mod signals;

pub use evaluator::{
    judge, HealthEvaluator, HealthSignal, HealthStatus, HealthThresholds, HealthVerdict,
    TunnelObservation,
};
pub use signals::{parse_byte_counters, parse_handshake_age, ByteCounters, HandshakeAge};
