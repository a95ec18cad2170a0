//! Injected metrics capability: an explicit `MetricsSink` constructed once
//! in `main` and passed down, rather than a process-global registrar.
//!
//! The default implementation calls straight through to the `metrics`
//! crate macros re-exported by `telemetry_batteries`.

use std::fmt;
use std::sync::Arc;

use telemetry_batteries::reexports::metrics::{counter, gauge, histogram};

pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn incr_duplicate(&self, network: &str) {
        let _ = network;
    }

    fn incr_ttl_adjustment(&self, network: &str, direction: TtlDirection) {
        let _ = (network, direction);
    }

    fn incr_reconnect(&self, network: &str, url: &str) {
        let _ = (network, url);
    }

    fn set_adaptive_ttl(&self, network: &str, item_type: &str, ttl_secs: f64) {
        let _ = (network, item_type, ttl_secs);
    }

    fn set_duplicate_rate(&self, network: &str, rate: f64) {
        let _ = (network, rate);
    }

    fn set_endpoint_ewma(&self, network: &str, url: &str, ewma_ms: f64) {
        let _ = (network, url, ewma_ms);
    }

    fn set_endpoint_weight(&self, network: &str, url: &str, weight: f64) {
        let _ = (network, url, weight);
    }

    fn set_breaker_state(&self, network: &str, url: &str, state: u8) {
        let _ = (network, url, state);
    }

    fn set_memory_pressure(&self, network: &str, pressure: f64) {
        let _ = (network, pressure);
    }

    fn observe_dedup_duration(&self, network: &str, secs: f64) {
        let _ = (network, secs);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlDirection {
    Up,
    Down,
}

impl TtlDirection {
    fn label(self) -> &'static str {
        match self {
            TtlDirection::Up => "up",
            TtlDirection::Down => "down",
        }
    }
}

/// Default sink: forwards every call to the process-wide `metrics` registry
/// via the teacher's `telemetry_batteries` re-export.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatteriesMetricsSink;

impl MetricsSink for BatteriesMetricsSink {
    fn incr_duplicate(&self, network: &str) {
        counter!("relay_duplicates_suppressed_total", "network" => network.to_string())
            .increment(1);
    }

    fn incr_ttl_adjustment(&self, network: &str, direction: TtlDirection) {
        counter!(
            "relay_ttl_adjustments_total",
            "network" => network.to_string(),
            "direction" => direction.label(),
        )
        .increment(1);
    }

    fn incr_reconnect(&self, network: &str, url: &str) {
        counter!(
            "relay_reconnects_total",
            "network" => network.to_string(),
            "url" => url.to_string(),
        )
        .increment(1);
    }

    fn set_adaptive_ttl(&self, network: &str, item_type: &str, ttl_secs: f64) {
        gauge!(
            "relay_dedup_adaptive_ttl_seconds",
            "network" => network.to_string(),
            "type" => item_type.to_string(),
        )
        .set(ttl_secs);
    }

    fn set_duplicate_rate(&self, network: &str, rate: f64) {
        gauge!("relay_dedup_duplicate_rate", "network" => network.to_string()).set(rate);
    }

    fn set_endpoint_ewma(&self, network: &str, url: &str, ewma_ms: f64) {
        gauge!(
            "relay_endpoint_ewma_ms",
            "network" => network.to_string(),
            "url" => url.to_string(),
        )
        .set(ewma_ms);
    }

    fn set_endpoint_weight(&self, network: &str, url: &str, weight: f64) {
        gauge!(
            "relay_endpoint_weight",
            "network" => network.to_string(),
            "url" => url.to_string(),
        )
        .set(weight);
    }

    fn set_breaker_state(&self, network: &str, url: &str, state: u8) {
        gauge!(
            "relay_endpoint_breaker_state",
            "network" => network.to_string(),
            "url" => url.to_string(),
        )
        .set(state as f64);
    }

    fn set_memory_pressure(&self, network: &str, pressure: f64) {
        gauge!("relay_dedup_memory_pressure", "network" => network.to_string()).set(pressure);
    }

    fn observe_dedup_duration(&self, network: &str, secs: f64) {
        histogram!("relay_dedup_processing_duration_seconds", "network" => network.to_string())
            .record(secs);
    }
}

/// A sink that records nothing; used in tests so assertions don't depend on
/// a live metrics registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

pub fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetricsSink)
}
