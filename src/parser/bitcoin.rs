//! Bitcoin P2P `block` message parsing.

use bitcoin::consensus::encode::deserialize;
use bitcoin::Block;
use serde_json::Value;

use crate::error::RelayError;
use crate::model::{is_zero_sentinel, BlockEvent};

use super::{wall_clock_fallback_secs, BlockParser};

pub struct BitcoinParser;

impl BlockParser for BitcoinParser {
    fn network(&self) -> &str {
        "bitcoin"
    }

    /// `payload` is `{"raw": "<hex-encoded block bytes>", "height": <u32, optional>}`,
    /// the shape the connection manager hands the wire-decoded `block` message in as.
    fn parse(&self, payload: &Value, source: &str, tier: &str) -> Result<BlockEvent, RelayError> {
        let raw_hex = payload
            .get("raw")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Malformed("bitcoin block payload missing raw hex".into()))?;

        let raw = hex::decode(raw_hex).map_err(|e| RelayError::Malformed(format!("invalid hex: {e}")))?;
        let block: Block = deserialize(&raw).map_err(|e| RelayError::Malformed(format!("invalid block encoding: {e}")))?;

        let hash = block.block_hash().to_string();
        if is_zero_sentinel(&hash) {
            return Err(RelayError::Malformed("all-zero block hash".into()));
        }

        let height = payload.get("height").and_then(Value::as_u64).map(|h| h as u32);
        let timestamp = block.header.time as u64;
        let timestamp = if timestamp == 0 { wall_clock_fallback_secs() } else { timestamp };

        BlockEvent::new(self.network(), format!("0x{hash}"), height, timestamp, source, tier, None)
            .map_err(|e| RelayError::Malformed(e.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_raw_field() {
        let parser = BitcoinParser;
        let err = parser.parse(&serde_json::json!({}), "btc-node-1", "FREE").unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[test]
    fn rejects_invalid_hex() {
        let parser = BitcoinParser;
        let payload = serde_json::json!({"raw": "not-hex"});
        let err = parser.parse(&payload, "btc-node-1", "FREE").unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }
}
