//! Prometheus metrics for one Colony node.
//!
//! Each node owns its own [`prometheus::Registry`], so several nodes can run
//! in one test process without colliding on metric names.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::{LATENCY_BUCKETS, ObservabilityError};

/// Cumulative bus totals, mirrored into the Prometheus counters on scrape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusCounters {
    pub dispatched: u64,
    pub dropped_no_route: u64,
    pub dropped_stopped: u64,
    pub unhandled: u64,
    pub relay_failures: u64,
    pub pending: usize,
}

#[derive(Debug, Clone)]
pub struct RuntimeMetrics {
    registry: Registry,
    events_dispatched_total: IntCounter,
    events_dropped_total: IntCounterVec,
    rpc_calls_total: IntCounterVec,
    rpc_duration_seconds: HistogramVec,
    rounds_completed_total: IntCounter,
    bus_pending: IntGauge,
    workers_registered: IntGauge,
}

impl RuntimeMetrics {
    pub fn new() -> Result<Self, ObservabilityError> {
        let registry = Registry::new();

        let events_dispatched_total = IntCounter::new(
            "colony_events_dispatched_total",
            "Events accepted by this node's bus",
        )?;
        let events_dropped_total = IntCounterVec::new(
            Opts::new("colony_events_dropped_total", "Events dropped by reason"),
            &["reason"],
        )?;
        let rpc_calls_total = IntCounterVec::new(
            Opts::new("colony_rpc_calls_total", "Outbound RPC calls by operation and outcome"),
            &["op", "outcome"],
        )?;
        let rpc_duration_seconds = HistogramVec::new(
            HistogramOpts::new("colony_rpc_duration_seconds", "Outbound RPC latency by operation")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )?;
        let rounds_completed_total = IntCounter::new(
            "colony_rounds_completed_total",
            "Rounds or timed steps completed by the environment",
        )?;
        let bus_pending = IntGauge::new("colony_bus_pending", "Events queued or in flight")?;
        let workers_registered =
            IntGauge::new("colony_workers_registered", "Live workers known to the master")?;

        registry.register(Box::new(events_dispatched_total.clone()))?;
        registry.register(Box::new(events_dropped_total.clone()))?;
        registry.register(Box::new(rpc_calls_total.clone()))?;
        registry.register(Box::new(rpc_duration_seconds.clone()))?;
        registry.register(Box::new(rounds_completed_total.clone()))?;
        registry.register(Box::new(bus_pending.clone()))?;
        registry.register(Box::new(workers_registered.clone()))?;

        Ok(Self {
            registry,
            events_dispatched_total,
            events_dropped_total,
            rpc_calls_total,
            rpc_duration_seconds,
            rounds_completed_total,
            bus_pending,
            workers_registered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count one outbound RPC and its latency
    pub fn record_rpc(&self, op: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "ok" } else { "error" };
        self.rpc_calls_total.with_label_values(&[op, outcome]).inc();
        self.rpc_duration_seconds
            .with_label_values(&[op])
            .observe(elapsed.as_secs_f64());
    }

    /// Count an RPC refused locally by an open circuit breaker
    pub fn record_rpc_rejected(&self, op: &str) {
        self.rpc_calls_total
            .with_label_values(&[op, "rejected"])
            .inc();
    }

    pub fn record_round_completed(&self) {
        self.rounds_completed_total.inc();
    }

    pub fn set_workers_registered(&self, count: usize) {
        self.workers_registered.set(count as i64);
    }

    /// Bring counters up to the bus's cumulative totals
    pub fn observe_bus(&self, totals: BusCounters) {
        advance(&self.events_dispatched_total, totals.dispatched);
        advance(
            &self.events_dropped_total.with_label_values(&["no_route"]),
            totals.dropped_no_route,
        );
        advance(
            &self.events_dropped_total.with_label_values(&["stopped"]),
            totals.dropped_stopped,
        );
        advance(
            &self.events_dropped_total.with_label_values(&["unhandled"]),
            totals.unhandled,
        );
        advance(
            &self.events_dropped_total.with_label_values(&["relay_failed"]),
            totals.relay_failures,
        );
        self.bus_pending.set(totals.pending as i64);
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed_total.get()
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> Result<String, ObservabilityError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ObservabilityError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| ObservabilityError::Encode(e.to_string()))
    }
}

fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
