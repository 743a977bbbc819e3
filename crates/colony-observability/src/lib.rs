//! Colony Observability
//!
//! Structured logging setup shared by every Colony binary and the
//! Prometheus [`RuntimeMetrics`] each node exposes at `GET /metrics`.

pub mod metrics;
pub mod trace;

pub use metrics::{BusCounters, RuntimeMetrics};
pub use trace::{LogFormat, init_tracing};

/// Latency buckets for RPC round trips, 1ms to 10s
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.01,  // 10ms
    0.05,  // 50ms
    0.1,   // 100ms
    0.25,  // 250ms
    0.5,   // 500ms
    1.0,   // 1s
    2.5,   // 2.5s
    5.0,   // 5s
    10.0,  // 10s
];

#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("Metrics initialization failed: {0}")]
    MetricsInit(String),

    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Metrics encoding failed: {0}")]
    Encode(String),
}

impl From<prometheus::Error> for ObservabilityError {
    fn from(err: prometheus::Error) -> Self {
        ObservabilityError::MetricsInit(err.to_string())
    }
}
