//! Adaptive block deduplicator.
//!
//! The store (entries + insertion order + per-type stats) lives behind one
//! `parking_lot::RwLock`; the running total/duplicate counters that drive
//! TTL tuning are plain atomics so `duplicate_rate()` never has to take the
//! write lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::metrics::{MetricsSink, TtlDirection};
use crate::model::{now_unix_ms, DedupEntry};

/// How a dedup key is derived from a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Cross-network mode (tier-gated): key = identifier only.
    CrossNetwork,
    /// Default: key = `<network>:<identifier>`.
    PerNetwork,
    /// Per-network with slot prefix (Solana-style):
    /// key = `slot_<n>:<type>:<identifier>`.
    SlotPrefixed,
}

fn compute_key(mode: KeyMode, network: &str, identifier: &str, item_type: &str, slot: Option<u64>) -> String {
    match mode {
        KeyMode::CrossNetwork => identifier.to_string(),
        KeyMode::PerNetwork => format!("{network}:{identifier}"),
        KeyMode::SlotPrefixed => {
            let n = slot.unwrap_or_default();
            format!("slot_{n}:{item_type}:{identifier}")
        }
    }
}

/// Independent capability axes set from tier at construction, mutable via
/// `set_tier`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierGates {
    pub cross_network_dedup: bool,
    pub priority_eviction: bool,
    pub confidence_scoring: bool,
    pub ml_ttl_tuning: bool,
}

impl TierGates {
    pub fn free() -> Self {
        Self::default()
    }

    pub fn business() -> Self {
        Self {
            cross_network_dedup: false,
            priority_eviction: true,
            confidence_scoring: true,
            ml_ttl_tuning: false,
        }
    }

    pub fn enterprise() -> Self {
        Self {
            cross_network_dedup: true,
            priority_eviction: true,
            confidence_scoring: true,
            ml_ttl_tuning: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub capacity: usize,
    pub base_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// Default 30s.
    pub adjust_every: Duration,
    pub learning_rate: f64,
    pub prefer_slot_keying: bool,
    pub network: String,
}

impl DedupConfig {
    pub fn new(network: impl Into<String>, base_ttl_secs: u64, capacity: usize) -> Self {
        Self {
            capacity,
            base_ttl_secs,
            min_ttl_secs: (base_ttl_secs / 5).max(1),
            max_ttl_secs: base_ttl_secs * 6,
            adjust_every: Duration::from_secs(30),
            learning_rate: 0.15,
            prefer_slot_keying: false,
            network: network.into(),
        }
    }
}

/// Parameters describing one sighting, passed to `Deduplicator::seen`.
#[derive(Debug, Clone, Default)]
pub struct SeenOptions {
    pub priority: Option<i32>,
    pub slot_or_height: Option<u64>,
    pub source: String,
    /// Caller opts into cross-network keying for this sighting; only takes
    /// effect if the tier gate also allows it.
    pub cross_network: bool,
}

fn network_priority(item_type: &str, opts: &SeenOptions) -> i32 {
    if let Some(p) = opts.priority {
        return p;
    }
    match item_type {
        "block" => 10,
        "slot" => 6,
        "transaction" => 5,
        _ => 1,
    }
}

fn type_ttl_multiplier(item_type: &str) -> f64 {
    match item_type {
        "slot" => 1.2,
        "transaction" => 0.8,
        _ => 1.0,
    }
}

/// Effective TTL for `item_type`, preferring the adaptively-tuned value over
/// `base_ttl_secs * type_ttl_multiplier`. Takes an already-held `&Store` so
/// it can be called from inside a section that holds the store's write
/// lock without re-acquiring it.
fn ttl_for_type(store: &Store, base_ttl_secs: u64, item_type: &str) -> u64 {
    if let Some(ts) = store.type_stats.get(item_type) {
        if ts.adaptive_ttl_secs > 0.0 {
            return ts.adaptive_ttl_secs.round() as u64;
        }
    }
    (base_ttl_secs as f64 * type_ttl_multiplier(item_type)).round() as u64
}

#[derive(Debug, Default)]
struct TypeStats {
    total: u64,
    duplicates: u64,
    /// EWMA of inter-arrival time in ms, for velocity-aware tuning.
    inter_arrival_ewma_ms: f64,
    last_insert_ms: u64,
    adaptive_ttl_secs: f64,
}

struct Store {
    entries: HashMap<String, DedupEntry>,
    /// FIFO eviction order; may contain stale keys already removed by TTL
    /// cleanup or priority eviction — skipped lazily on pop.
    insertion_order: VecDeque<String>,
    type_stats: HashMap<String, TypeStats>,
}

impl Store {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            type_stats: HashMap::new(),
        }
    }
}

pub struct Deduplicator {
    store: RwLock<Store>,
    total_count: AtomicU64,
    duplicate_count: AtomicU64,
    config: RwLock<DedupConfig>,
    gates: RwLock<TierGates>,
    last_tuned_ms: AtomicI64,
    metrics: Arc<dyn MetricsSink>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig, gates: TierGates, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store: RwLock::new(Store::new()),
            total_count: AtomicU64::new(0),
            duplicate_count: AtomicU64::new(0),
            config: RwLock::new(config),
            gates: RwLock::new(gates),
            last_tuned_ms: AtomicI64::new(now_unix_ms() as i64),
            metrics,
        }
    }

    pub fn set_tier(&self, gates: TierGates) {
        *self.gates.write() = gates;
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_mode(&self, opts: &SeenOptions) -> KeyMode {
        let gates = self.gates.read();
        let cfg = self.config.read();
        if gates.cross_network_dedup && opts.cross_network {
            KeyMode::CrossNetwork
        } else if cfg.prefer_slot_keying && opts.slot_or_height.is_some() {
            KeyMode::SlotPrefixed
        } else {
            KeyMode::PerNetwork
        }
    }

    /// Convenience wrapper for callers that don't already hold `self.store`
    /// (e.g. tests). `seen()` must not call this — it would try to
    /// re-acquire `self.store` while already holding its write guard, which
    /// deadlocks `parking_lot::RwLock`. Use `ttl_for_type` with the guard
    /// you already hold instead.
    fn effective_ttl_secs(&self, item_type: &str) -> u64 {
        let base_ttl_secs = self.config.read().base_ttl_secs;
        let store = self.store.read();
        ttl_for_type(&store, base_ttl_secs, item_type)
    }

    pub fn seen(&self, network: &str, identifier: &str, item_type: &str, opts: SeenOptions) -> bool {
        let start = now_unix_ms();
        let key = compute_key(self.key_mode(&opts), network, identifier, item_type, opts.slot_or_height);

        self.total_count.fetch_add(1, Ordering::Relaxed);

        let is_duplicate = {
            let mut store = self.store.write();
            {
                let ts = store.type_stats.entry(item_type.to_string()).or_default();
                ts.total += 1;
            }

            let base_ttl_secs = self.config.read().base_ttl_secs;
            let ttl_secs = ttl_for_type(&store, base_ttl_secs, item_type);
            let now = now_unix_ms();

            let existing_is_fresh = store
                .entries
                .get(&key)
                .map(|e| now.saturating_sub(e.last_seen_ms) <= ttl_secs * 1000)
                .unwrap_or(false);

            if existing_is_fresh {
                let gates = *self.gates.read();
                let entry = store.entries.get_mut(&key).unwrap();
                entry.last_seen_ms = now;
                entry.seen_count += 1;
                if gates.confidence_scoring {
                    entry.confidence = (entry.confidence + 0.1).min(1.0);
                }
                let ts = store.type_stats.get_mut(item_type).unwrap();
                ts.duplicates += 1;
                true
            } else {
                let capacity = self.config.read().capacity;
                if store.entries.len() >= capacity && !store.entries.contains_key(&key) {
                    self.evict_one(&mut store, network);
                }

                let priority = network_priority(item_type, &opts);
                let mut entry = DedupEntry::new(identifier, item_type, priority, opts.slot_or_height, opts.source.clone());

                let gates = *self.gates.read();
                if !gates.confidence_scoring {
                    entry.confidence = 1.0;
                }

                store.insertion_order.push_back(key.clone());
                store.entries.insert(key.clone(), entry);

                let ts = store.type_stats.get_mut(item_type).unwrap();
                if ts.last_insert_ms != 0 {
                    let delta = now.saturating_sub(ts.last_insert_ms) as f64;
                    let alpha = self.config.read().learning_rate;
                    ts.inter_arrival_ewma_ms = if ts.inter_arrival_ewma_ms == 0.0 {
                        delta
                    } else {
                        alpha * delta + (1.0 - alpha) * ts.inter_arrival_ewma_ms
                    };
                }
                ts.last_insert_ms = now;

                false
            }
        };

        if is_duplicate {
            self.duplicate_count.fetch_add(1, Ordering::Relaxed);
            self.metrics.incr_duplicate(network);
        }

        self.maybe_tune(item_type, network);
        self.metrics
            .observe_dedup_duration(network, (now_unix_ms().saturating_sub(start)) as f64 / 1000.0);

        is_duplicate
    }

    /// FIFO by default; priority-aware when tier-gated and a lower-priority
    /// victim exists.
    fn evict_one(&self, store: &mut Store, network: &str) {
        let gates = *self.gates.read();
        if gates.priority_eviction {
            if self.evict_lowest_priority(store) {
                self.metrics.set_memory_pressure(network, 1.0);
                return;
            }
        }
        self.evict_fifo(store);
        self.metrics.set_memory_pressure(network, 1.0);
    }

    fn evict_fifo(&self, store: &mut Store) {
        while let Some(oldest_key) = store.insertion_order.pop_front() {
            if store.entries.remove(&oldest_key).is_some() {
                return;
            }
        }
    }

    /// Scans for the lowest-priority entry (ties broken by oldest
    /// last-seen); returns `false` (falls back to FIFO) if none found.
    fn evict_lowest_priority(&self, store: &mut Store) -> bool {
        let victim = store
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.last_seen_ms.cmp(&b.last_seen_ms))
            })
            .map(|(k, _)| k.clone());

        if let Some(key) = victim {
            store.entries.remove(&key);
            store.insertion_order.retain(|k| k != &key);
            true
        } else {
            false
        }
    }

    /// Basic mode uses the fixed-step rule; the ML tier gate switches to
    /// the adaptive (factor-based) rule.
    fn maybe_tune(&self, item_type: &str, network: &str) {
        let adjust_every = self.config.read().adjust_every;
        let now = now_unix_ms() as i64;
        let last = self.last_tuned_ms.load(Ordering::Relaxed);
        if now - last < adjust_every.as_millis() as i64 {
            return;
        }
        if self
            .last_tuned_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // another caller already ran this tick
        }

        let adaptive = self.gates.read().ml_ttl_tuning;
        let mut store = self.store.write();
        let base_ttl = self.config.read().base_ttl_secs;
        let (min_ttl, max_ttl) = {
            let cfg = self.config.read();
            (cfg.min_ttl_secs, cfg.max_ttl_secs)
        };

        let Some(ts) = store.type_stats.get_mut(item_type) else {
            return;
        };
        let rate = if ts.total > 0 {
            ts.duplicates as f64 / ts.total as f64
        } else {
            0.0
        };
        self.metrics.set_duplicate_rate(network, rate);

        let current_ttl = if ts.adaptive_ttl_secs > 0.0 {
            ts.adaptive_ttl_secs
        } else {
            base_ttl as f64 * type_ttl_multiplier(item_type)
        };

        let new_ttl = if adaptive {
            let target = 0.30;
            let learning_rate = self.config.read().learning_rate;
            let mut factor = 1.0 + (rate - target) * learning_rate * 2.0;
            // High velocity (short inter-arrival) shortens TTL, low velocity
            // lengthens it.
            if ts.inter_arrival_ewma_ms > 0.0 {
                let velocity_factor = (ts.inter_arrival_ewma_ms / 1000.0).clamp(0.5, 2.0);
                factor *= 1.0 / velocity_factor.sqrt();
            }
            current_ttl * factor * type_ttl_multiplier(item_type)
        } else if rate > 0.50 {
            current_ttl + 10.0
        } else if rate > 0.25 {
            current_ttl + 5.0
        } else if rate < 0.05 {
            current_ttl - 5.0
        } else {
            current_ttl + 1.0
        };

        let clamped = new_ttl.clamp(min_ttl as f64, max_ttl as f64);
        let direction = if clamped > current_ttl {
            Some(TtlDirection::Up)
        } else if clamped < current_ttl {
            Some(TtlDirection::Down)
        } else {
            None
        };
        ts.adaptive_ttl_secs = clamped;

        // Partial decay so the controller tracks recent behavior.
        ts.total /= 2;
        ts.duplicates /= 2;

        self.metrics.set_adaptive_ttl(network, item_type, clamped);
        if let Some(dir) = direction {
            self.metrics.incr_ttl_adjustment(network, dir);
        }
    }

    /// Periodic sweep removing entries past their effective TTL.
    /// Confidence scoring, when enabled, scales the effective TTL down
    /// proportionally to confidence.
    pub fn sweep(&self) {
        let gates = *self.gates.read();
        let now = now_unix_ms();
        let mut store = self.store.write();

        let ttl_by_type: HashMap<String, u64> = store
            .type_stats
            .iter()
            .map(|(t, ts)| {
                let base = if ts.adaptive_ttl_secs > 0.0 {
                    ts.adaptive_ttl_secs
                } else {
                    0.0
                };
                (t.clone(), base.round() as u64)
            })
            .collect();
        let default_ttl = self.config.read().base_ttl_secs;

        let mut to_remove = Vec::new();
        for (key, entry) in store.entries.iter() {
            let mut ttl_secs = *ttl_by_type.get(&entry.item_type).unwrap_or(&0);
            if ttl_secs == 0 {
                ttl_secs = (default_ttl as f64 * type_ttl_multiplier(&entry.item_type)).round() as u64;
            }
            if gates.confidence_scoring && entry.confidence > 0.0 {
                ttl_secs = ((ttl_secs as f64) * entry.confidence).round() as u64;
            }
            if now.saturating_sub(entry.last_seen_ms) > ttl_secs * 1000 {
                to_remove.push(key.clone());
            }
        }

        for key in &to_remove {
            store.entries.remove(key);
        }
        store.insertion_order.retain(|k| store.entries.contains_key(k));
    }

    pub fn duplicate_rate(&self) -> f64 {
        let total = self.total_count.load(Ordering::Relaxed);
        let dups = self.duplicate_count.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            dups as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::noop_sink;

    fn dedup(capacity: usize, base_ttl_secs: u64) -> Deduplicator {
        Deduplicator::new(
            DedupConfig::new("bitcoin", base_ttl_secs, capacity),
            TierGates::enterprise(),
            noop_sink(),
        )
    }

    #[test]
    fn first_sighting_is_not_duplicate_then_is() {
        let d = dedup(100, 60);
        let opts = SeenOptions {
            source: "bitcoin-relay".into(),
            ..Default::default()
        };
        assert!(!d.seen("bitcoin", "hash-1", "block", opts.clone()));
        assert!(d.seen("bitcoin", "hash-1", "block", opts));
    }

    #[test]
    fn duplicate_after_ttl_expiry_is_not_a_duplicate() {
        let d = dedup(100, 0); // TTL rounds to 0s — anything is immediately stale
        let opts = SeenOptions {
            source: "bitcoin-relay".into(),
            ..Default::default()
        };
        assert!(!d.seen("bitcoin", "hash-2", "block", opts.clone()));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!d.seen("bitcoin", "hash-2", "block", opts));
    }

    #[test]
    fn capacity_is_bounded_by_fifo_eviction() {
        let d = dedup(4, 3600);
        for i in 0..10 {
            let opts = SeenOptions {
                source: "bitcoin-relay".into(),
                ..Default::default()
            };
            d.seen("bitcoin", &format!("hash-{i}"), "block", opts);
            assert!(d.len() <= 4);
        }
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn priority_eviction_prefers_lower_priority_victim() {
        let d = dedup(2, 3600);
        let low = SeenOptions {
            priority: Some(1),
            source: "generic-relay".into(),
            ..Default::default()
        };
        let high = SeenOptions {
            priority: Some(10),
            source: "bitcoin-relay".into(),
            ..Default::default()
        };
        d.seen("generic", "low-1", "block", low.clone());
        d.seen("bitcoin", "high-1", "block", high.clone());
        // Store is full (capacity=2); inserting a third high-priority item
        // should evict the low-priority one, not FIFO-oldest.
        d.seen("bitcoin", "high-2", "block", high);
        assert!(!d.seen("bitcoin", "high-1", "block", SeenOptions::default()));
        assert!(!d.seen("generic", "low-1", "block", SeenOptions::default()));
    }

    #[test]
    fn per_network_keying_isolates_identical_identifiers() {
        let d = dedup(100, 3600);
        let opts = SeenOptions::default();
        assert!(!d.seen("bitcoin", "shared-id", "block", opts.clone()));
        // Same identifier, different network: not a duplicate under the
        // default per-network keying mode.
        assert!(!d.seen("ethereum", "shared-id", "block", opts));
    }

    #[test]
    fn cross_network_keying_collapses_identical_identifiers() {
        let d = dedup(100, 3600);
        let opts = SeenOptions {
            cross_network: true,
            ..Default::default()
        };
        assert!(!d.seen("bitcoin", "shared-id", "block", opts.clone()));
        assert!(d.seen("ethereum", "shared-id", "block", opts));
    }

    #[test]
    fn basic_ttl_tuning_raises_ttl_under_sustained_high_duplicate_rate() {
        let d = Deduplicator::new(
            DedupConfig {
                adjust_every: Duration::from_millis(0),
                ..DedupConfig::new("slot-network", 60, 10_000)
            },
            TierGates::business(), // ml_ttl_tuning = false -> basic mode
            noop_sink(),
        );

        for round in 0..20 {
            let opts = SeenOptions::default();
            let id = format!("id-{round}");
            d.seen("solana", &id, "slot", opts.clone());
            d.seen("solana", &id, "slot", opts); // duplicate within TTL
        }

        let ttl = d.effective_ttl_secs("slot");
        assert!(ttl > (60.0 * type_ttl_multiplier("slot")) as u64);
    }

    #[test]
    fn sweep_removes_stale_entries() {
        let d = dedup(100, 0);
        d.seen("bitcoin", "stale-1", "block", SeenOptions::default());
        std::thread::sleep(Duration::from_millis(5));
        d.sweep();
        assert_eq!(d.len(), 0);
    }
}
