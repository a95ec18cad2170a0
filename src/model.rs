//! Canonical data model shared across the health registry, deduplicator,
//! and relay clients.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// All-zero identifier sentinel, e.g. `0x0000...0000` — never a valid block id.
pub fn is_zero_sentinel(hash_hex: &str) -> bool {
    let trimmed = hash_hex.trim_start_matches("0x");
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '0')
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Canonical output record for every normalized block observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub network: String,
    /// Hex hash, or a synthetic `slot:<n>` identifier for slot-based chains.
    pub identifier: String,
    pub height: Option<u32>,
    /// Wall-clock block timestamp (unix seconds), as reported by the chain.
    pub timestamp: u64,
    /// Local monotonic-ish wall clock at ingest (unix ms).
    pub detected_at_ms: u64,
    pub source: String,
    pub tier: String,
    pub relay_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockEventError(pub String);

impl std::fmt::Display for BlockEventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid block event: {}", self.0)
    }
}

impl std::error::Error for BlockEventError {}

impl BlockEvent {
    /// Construct and validate: identifier must be non-empty and not the
    /// all-zero sentinel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: impl Into<String>,
        identifier: impl Into<String>,
        height: Option<u32>,
        timestamp: u64,
        source: impl Into<String>,
        tier: impl Into<String>,
        relay_time_ms: Option<u64>,
    ) -> Result<Self, BlockEventError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(BlockEventError("empty identifier".into()));
        }
        if identifier.starts_with("0x") && is_zero_sentinel(&identifier) {
            return Err(BlockEventError("all-zero sentinel identifier".into()));
        }
        Ok(Self {
            network: network.into(),
            identifier,
            height,
            timestamp,
            detected_at_ms: now_unix_ms(),
            source: source.into(),
            tier: tier.into(),
            relay_time_ms,
        })
    }
}

/// Breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    /// Numeric encoding for the `relay_endpoint_breaker_state` gauge.
    pub fn as_metric(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

/// Per-URL health record.
#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub url: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub last_error: Option<String>,
    pub success_count: u64,
    pub error_count: u64,
    /// Bounded ring of the last N response-time samples (ms), default N=10.
    pub rtt_samples: Vec<f64>,
    pub rtt_samples_cap: usize,
    pub ewma_ms: f64,
    pub breaker: BreakerState,
    pub breaker_open_until_ms: u64,
    pub weight: f64,
}

impl EndpointStats {
    pub fn new(url: impl Into<String>) -> Self {
        let now = now_unix_ms();
        Self {
            url: url.into(),
            first_seen_ms: now,
            last_seen_ms: now,
            last_error: None,
            success_count: 0,
            error_count: 0,
            rtt_samples: Vec::with_capacity(10),
            rtt_samples_cap: 10,
            ewma_ms: 0.0,
            breaker: BreakerState::Closed,
            breaker_open_until_ms: 0,
            weight: 1.0,
        }
    }

    pub fn push_rtt_sample(&mut self, rtt_ms: f64) {
        if self.rtt_samples.len() >= self.rtt_samples_cap {
            self.rtt_samples.remove(0);
        }
        self.rtt_samples.push(rtt_ms);
    }
}

/// One record per (key, item-type) in the deduplicator.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub identifier: String,
    pub item_type: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub seen_count: u64,
    pub confidence: f64,
    pub priority: i32,
    pub slot_or_height: Option<u64>,
    pub source: String,
    pub properties: HashMap<String, Value>,
}

impl DedupEntry {
    pub fn new(
        identifier: impl Into<String>,
        item_type: impl Into<String>,
        priority: i32,
        slot_or_height: Option<u64>,
        source: impl Into<String>,
    ) -> Self {
        let now = now_unix_ms();
        Self {
            identifier: identifier.into(),
            item_type: item_type.into(),
            first_seen_ms: now,
            last_seen_ms: now,
            seen_count: 1,
            confidence: 0.5,
            priority,
            slot_or_height,
            source: source.into(),
            properties: HashMap::new(),
        }
    }
}

/// Per-network dedup policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub ttl_secs: u64,
    pub capacity: usize,
    pub priority: i32,
    pub optimization_level: OptimizationLevel,
    pub cross_network: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Turbo,
    Pro,
    Standard,
}

/// Policy tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Free,
    Business,
    Enterprise,
}

impl Tier {
    /// Default dedup capacity for this tier.
    pub fn default_capacity(self) -> usize {
        match self {
            Tier::Free => 2048,
            Tier::Business => 8192,
            Tier::Enterprise => 16384,
        }
    }

    /// Default dedup base TTL for "Bitcoin-scale" networks (minutes-grained).
    pub fn default_ttl_secs_block_scale(self) -> u64 {
        match self {
            Tier::Free => 5 * 60,
            Tier::Business => 10 * 60,
            Tier::Enterprise => 15 * 60,
        }
    }

    /// Default dedup base TTL for "Solana-scale" (slot-grained) networks.
    pub fn default_ttl_secs_slot_scale(self) -> u64 {
        match self {
            Tier::Free => 20,
            Tier::Business => 30,
            Tier::Enterprise => 45,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identifier() {
        assert!(BlockEvent::new("bitcoin", "", None, 0, "bitcoin-relay", "FREE", None).is_err());
    }

    #[test]
    fn rejects_zero_sentinel() {
        let zero = format!("0x{}", "0".repeat(64));
        assert!(
            BlockEvent::new("ethereum", zero, Some(1), 0, "ethereum-relay", "FREE", None).is_err()
        );
    }

    #[test]
    fn accepts_valid_event() {
        let ev = BlockEvent::new(
            "ethereum",
            "0xabc0000000000000000000000000000000000000000000000000000000001",
            Some(0x10d4f),
            0x65f00000,
            "ethereum-relay",
            "FREE",
            None,
        )
        .unwrap();
        assert_eq!(ev.network, "ethereum");
        assert_eq!(ev.height, Some(0x10d4f));
    }

    #[test]
    fn slot_identifier_is_not_sentinel() {
        // `slot:0` doesn't start with 0x so it isn't treated as a sentinel by
        // this helper — the Solana parser rejects slot 0 itself.
        assert!(!is_zero_sentinel("slot:0"));
    }

    #[test]
    fn endpoint_stats_ring_buffer_bounded() {
        let mut stats = EndpointStats::new("wss://example");
        for i in 0..15 {
            stats.push_rtt_sample(i as f64);
        }
        assert_eq!(stats.rtt_samples.len(), 10);
        assert_eq!(stats.rtt_samples.first().copied(), Some(5.0));
    }

    #[test]
    fn tier_capacities() {
        assert_eq!(Tier::Free.default_capacity(), 2048);
        assert_eq!(Tier::Business.default_capacity(), 8192);
        assert_eq!(Tier::Enterprise.default_capacity(), 16384);
    }
}
