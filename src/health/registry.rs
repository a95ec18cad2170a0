//! Endpoint health registry.
//!
//! Per-URL state lives behind a single `parking_lot::RwLock`, never held
//! across an `.await` — every method here is synchronous and fast.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::metrics::MetricsSink;
use crate::model::{now_unix_ms, BreakerState, EndpointStats};

/// EWMA smoothing factor.
const EWMA_ALPHA: f64 = 0.2;
/// Breaker backoff base; `base * 2^min(errors, 8)` gives the open-until
/// horizon. Chosen so a breaker tripped after 6 failures opens for ~32s.
const BREAKER_BASE_BACKOFF_SECS: f64 = 0.5;
const BREAKER_MAX_BACKOFF_SECS: f64 = 256.0;
/// If there have been zero successes, this many consecutive failures trips
/// the breaker.
const NO_SUCCESS_TRIP_THRESHOLD: u64 = 6;
/// Minimum attempts before the error-ratio rule can trip the breaker, so a
/// single early failure doesn't immediately open it.
const MIN_ATTEMPTS_FOR_RATIO_RULE: u64 = 4;

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, EndpointStats>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure an entry exists for `url` without recording an outcome.
    pub fn ensure(&self, url: &str) {
        self.entries
            .write()
            .entry(url.to_string())
            .or_insert_with(|| EndpointStats::new(url));
    }

    pub fn record_success(&self, url: &str, rtt_ms: f64, network: &str, metrics: &dyn MetricsSink) {
        let mut entries = self.entries.write();
        let stats = entries
            .entry(url.to_string())
            .or_insert_with(|| EndpointStats::new(url));

        stats.last_seen_ms = now_unix_ms();
        stats.success_count += 1;
        stats.push_rtt_sample(rtt_ms);
        stats.ewma_ms = if stats.success_count == 1 {
            rtt_ms
        } else {
            EWMA_ALPHA * rtt_ms + (1.0 - EWMA_ALPHA) * stats.ewma_ms
        };
        stats.weight = (1000.0 / (stats.ewma_ms + 50.0)).max(0.1);

        let now = now_unix_ms();
        match stats.breaker {
            BreakerState::HalfOpen => stats.breaker = BreakerState::Closed,
            BreakerState::Open if now as u64 >= stats.breaker_open_until_ms => {
                stats.breaker = BreakerState::Closed;
            }
            _ => {}
        }

        metrics.set_endpoint_ewma(network, url, stats.ewma_ms);
        metrics.set_endpoint_weight(network, url, stats.weight);
        metrics.set_breaker_state(network, url, stats.breaker.as_metric());
    }

    pub fn record_failure(&self, url: &str, reason: &str, network: &str, metrics: &dyn MetricsSink) {
        let mut entries = self.entries.write();
        let stats = entries
            .entry(url.to_string())
            .or_insert_with(|| EndpointStats::new(url));

        stats.last_seen_ms = now_unix_ms();
        stats.last_error = Some(reason.to_string());
        stats.error_count += 1;
        stats.weight = (stats.weight * 0.5).max(0.1);

        let total = stats.success_count + stats.error_count;
        let ratio = stats.error_count as f64 / total.max(1) as f64;
        let should_trip = (stats.success_count == 0 && stats.error_count >= NO_SUCCESS_TRIP_THRESHOLD)
            || (total >= MIN_ATTEMPTS_FOR_RATIO_RULE && ratio > 0.5);

        if should_trip && stats.breaker != BreakerState::Open {
            let exponent = stats.error_count.min(8) as i32;
            let backoff_secs =
                (BREAKER_BASE_BACKOFF_SECS * 2f64.powi(exponent)).min(BREAKER_MAX_BACKOFF_SECS);
            stats.breaker = BreakerState::Open;
            stats.breaker_open_until_ms = now_unix_ms() + (backoff_secs * 1000.0) as u64;
            stats.weight = 0.0;
        } else if stats.breaker == BreakerState::HalfOpen {
            // One failure while probing demotes straight back to open.
            let exponent = stats.error_count.min(8) as i32;
            let backoff_secs =
                (BREAKER_BASE_BACKOFF_SECS * 2f64.powi(exponent)).min(BREAKER_MAX_BACKOFF_SECS);
            stats.breaker = BreakerState::Open;
            stats.breaker_open_until_ms = now_unix_ms() + (backoff_secs * 1000.0) as u64;
            stats.weight = 0.0;
        }

        metrics.set_endpoint_weight(network, url, stats.weight);
        metrics.set_breaker_state(network, url, stats.breaker.as_metric());
    }

    /// Lazily flips an `Open` entry whose `open_until` has passed into
    /// `HalfOpen`, restoring a probe weight. Called under the write lock.
    fn reopen_for_probe(stats: &mut EndpointStats) {
        if stats.breaker == BreakerState::Open && now_unix_ms() >= stats.breaker_open_until_ms {
            stats.breaker = BreakerState::HalfOpen;
            if stats.weight <= 0.0 {
                stats.weight = 0.1;
            }
        }
    }

    fn is_available(stats: &EndpointStats) -> bool {
        !(stats.breaker == BreakerState::Open && now_unix_ms() < stats.breaker_open_until_ms)
    }

    /// A consistent copy of all stats, for telemetry.
    pub fn snapshot(&self) -> Vec<EndpointStats> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedRegistry = Arc<Registry>;

/// Weighted-random endpoint pick over the registry, excluding breaker-open
/// entries.
pub struct Selector;

impl Selector {
    /// Sums weights over non-open entries; if the total is 0, reseeds all
    /// weights to 0.1, then draws a uniform real in `[0, total)` and returns
    /// the cumulative-weight match. O(N) over endpoints (N is small).
    pub fn pick_weighted(registry: &Registry) -> Option<String> {
        let mut entries = registry.entries.write();
        if entries.is_empty() {
            return None;
        }

        for stats in entries.values_mut() {
            Registry::reopen_for_probe(stats);
        }

        let mut total: f64 = entries
            .values()
            .filter(|s| Registry::is_available(s))
            .map(|s| s.weight)
            .sum();

        if total <= 0.0 {
            for stats in entries.values_mut() {
                if Registry::is_available(stats) {
                    stats.weight = 0.1;
                }
            }
            total = entries
                .values()
                .filter(|s| Registry::is_available(s))
                .map(|s| s.weight)
                .sum();
        }

        if total <= 0.0 {
            // Every endpoint is breaker-open; nothing to pick.
            return None;
        }

        let draw = rand::random::<f64>() * total;
        let mut cumulative = 0.0;
        for stats in entries.values() {
            if !Registry::is_available(stats) {
                continue;
            }
            cumulative += stats.weight;
            if draw < cumulative {
                return Some(stats.url.clone());
            }
        }

        // Floating point edge case: fall back to the last available entry.
        entries
            .values()
            .filter(|s| Registry::is_available(s))
            .last()
            .map(|s| s.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;

    #[test]
    fn breaker_never_returned_while_open() {
        let registry = Registry::new();
        let metrics = NoopMetricsSink;
        for _ in 0..6 {
            registry.record_failure("wss://bad", "dial failed", "bitcoin", &metrics);
        }
        let snap = registry.snapshot();
        let bad = snap.iter().find(|s| s.url == "wss://bad").unwrap();
        assert_eq!(bad.breaker, BreakerState::Open);
        assert!(bad.weight <= 0.1);

        for _ in 0..50 {
            assert_ne!(Selector::pick_weighted(&registry), Some("wss://bad".to_string()));
        }
    }

    #[test]
    fn weight_decays_by_half_on_failure() {
        let registry = Registry::new();
        let metrics = NoopMetricsSink;
        registry.record_success("wss://ok", 10.0, "ethereum", &metrics);
        let before = registry.snapshot()[0].weight;
        registry.record_failure("wss://ok", "timeout", "ethereum", &metrics);
        let after = registry.snapshot()[0].weight;
        assert!((after - (before * 0.5).max(0.1)).abs() < 1e-9);
    }

    #[test]
    fn success_closes_half_open_breaker() {
        let registry = Registry::new();
        let metrics = NoopMetricsSink;
        for _ in 0..6 {
            registry.record_failure("wss://flaky", "dial failed", "solana", &metrics);
        }
        {
            let mut entries = registry.entries.write();
            let stats = entries.get_mut("wss://flaky").unwrap();
            stats.breaker_open_until_ms = 0; // force past-due for the test
            stats.breaker = BreakerState::HalfOpen;
        }
        registry.record_success("wss://flaky", 20.0, "solana", &metrics);
        let snap = registry.snapshot();
        let s = snap.iter().find(|s| s.url == "wss://flaky").unwrap();
        assert_eq!(s.breaker, BreakerState::Closed);
    }

    #[test]
    fn pick_weighted_returns_none_when_registry_empty() {
        let registry = Registry::new();
        assert_eq!(Selector::pick_weighted(&registry), None);
    }

    #[test]
    fn pick_weighted_reseeds_when_all_weights_zero() {
        let registry = Registry::new();
        registry.ensure("wss://a");
        registry.ensure("wss://b");
        {
            let mut entries = registry.entries.write();
            for s in entries.values_mut() {
                s.weight = 0.0;
            }
        }
        let pick = Selector::pick_weighted(&registry);
        assert!(pick.is_some());
    }
}
