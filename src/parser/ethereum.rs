//! Ethereum `eth_subscription` (newHeads) and `eth_getBlockByNumber` result parsing.

use serde_json::Value;

use crate::error::RelayError;
use crate::model::{is_zero_sentinel, BlockEvent};

use super::{parse_hex_u64, wall_clock_fallback_secs, BlockParser};

pub struct EthereumParser;

impl BlockParser for EthereumParser {
    fn network(&self) -> &str {
        "ethereum"
    }

    /// `payload` is a decoded header/block object with `hash`, `number`, and
    /// `timestamp` hex-string fields, as returned by `eth_subscription`
    /// params or an `eth_getBlockByNumber` result.
    fn parse(&self, payload: &Value, source: &str, tier: &str) -> Result<BlockEvent, RelayError> {
        let hash = payload
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Malformed("ethereum block payload missing hash".into()))?;

        if !hash.starts_with("0x") || hash.len() != 66 {
            return Err(RelayError::Malformed(format!("malformed ethereum block hash: {hash}")));
        }
        if is_zero_sentinel(hash) {
            return Err(RelayError::Malformed("all-zero block hash".into()));
        }

        let height = payload
            .get("number")
            .and_then(Value::as_str)
            .and_then(parse_hex_u64)
            .map(|n| n as u32);

        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_hex_u64)
            .filter(|t| *t > 0)
            .unwrap_or_else(wall_clock_fallback_secs);

        BlockEvent::new(self.network(), hash.to_string(), height, timestamp, source, tier, None)
            .map_err(|e| RelayError::Malformed(e.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_header() {
        let parser = EthereumParser;
        let payload = serde_json::json!({
            "hash": format!("0x{}", "ab".repeat(32)),
            "number": "0x10d4f",
            "timestamp": "0x65f00000",
        });
        let ev = parser.parse(&payload, "ethereum-ws-1", "FREE").unwrap();
        assert_eq!(ev.height, Some(0x10d4f));
        assert_eq!(ev.timestamp, 0x65f00000);
    }

    #[test]
    fn falls_back_to_wall_clock_when_timestamp_missing() {
        let parser = EthereumParser;
        let payload = serde_json::json!({
            "hash": format!("0x{}", "ab".repeat(32)),
            "number": "0x1",
        });
        let ev = parser.parse(&payload, "ethereum-ws-1", "FREE").unwrap();
        assert!(ev.timestamp > 0);
    }

    #[test]
    fn rejects_zero_hash() {
        let parser = EthereumParser;
        let payload = serde_json::json!({"hash": format!("0x{}", "0".repeat(64))});
        assert!(parser.parse(&payload, "ethereum-ws-1", "FREE").is_err());
    }

    #[test]
    fn rejects_short_hash() {
        let parser = EthereumParser;
        let payload = serde_json::json!({"hash": "0xabc"});
        assert!(parser.parse(&payload, "ethereum-ws-1", "FREE").is_err());
    }
}
