//! Solana `slotNotification` parsing.

use serde_json::Value;

use crate::error::RelayError;
use crate::model::BlockEvent;

use super::{wall_clock_fallback_secs, BlockParser};

pub struct SolanaParser;

impl BlockParser for SolanaParser {
    fn network(&self) -> &str {
        "solana"
    }

    /// `payload` is the `slotNotification` params object: `{"parent": u64,
    /// "root": u64, "slot": u64}`. Solana doesn't carry a block timestamp on
    /// the slot notification itself, so we always fall back to wall clock.
    fn parse(&self, payload: &Value, source: &str, tier: &str) -> Result<BlockEvent, RelayError> {
        let slot = payload
            .get("slot")
            .and_then(Value::as_u64)
            .ok_or_else(|| RelayError::Malformed("solana slot notification missing slot".into()))?;

        if slot == 0 {
            return Err(RelayError::Malformed("slot 0 is not a valid sentinel slot".into()));
        }

        let identifier = format!("slot:{slot}");
        let timestamp = wall_clock_fallback_secs();

        BlockEvent::new(self.network(), identifier, None, timestamp, source, tier, None)
            .map_err(|e| RelayError::Malformed(e.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_slot_zero() {
        let parser = SolanaParser;
        let payload = serde_json::json!({"slot": 0, "parent": 0, "root": 0});
        assert!(parser.parse(&payload, "solana-ws-1", "FREE").is_err());
    }

    #[test]
    fn accepts_nonzero_slot() {
        let parser = SolanaParser;
        let payload = serde_json::json!({"slot": 250_000_123u64, "parent": 250_000_122u64, "root": 250_000_000u64});
        let ev = parser.parse(&payload, "solana-ws-1", "FREE").unwrap();
        assert_eq!(ev.identifier, "slot:250000123");
        assert!(ev.height.is_none());
    }
}
