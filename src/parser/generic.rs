//! Generic JSON-RPC network parsing: looks for a configurable identifier
//! field and a best-effort height/timestamp, for chains that don't get a
//! dedicated parser.

use serde_json::Value;

use crate::error::RelayError;
use crate::model::{is_zero_sentinel, BlockEvent};

use super::{parse_hex_u64, wall_clock_fallback_secs, BlockParser};

pub struct GenericParser {
    pub network_name: String,
    /// JSON field to read the block identifier from, e.g. `"hash"` or `"id"`.
    pub identifier_field: String,
    pub height_field: Option<String>,
    pub timestamp_field: Option<String>,
}

impl GenericParser {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            identifier_field: "hash".to_string(),
            height_field: Some("number".to_string()),
            timestamp_field: Some("timestamp".to_string()),
        }
    }
}

impl BlockParser for GenericParser {
    fn network(&self) -> &str {
        &self.network_name
    }

    fn parse(&self, payload: &Value, source: &str, tier: &str) -> Result<BlockEvent, RelayError> {
        let identifier = payload
            .get(&self.identifier_field)
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::Malformed(format!("missing '{}' field", self.identifier_field)))?;

        if identifier.is_empty() {
            return Err(RelayError::Malformed("empty identifier".into()));
        }
        if identifier.starts_with("0x") && is_zero_sentinel(identifier) {
            return Err(RelayError::Malformed("all-zero sentinel identifier".into()));
        }

        let height = self
            .height_field
            .as_ref()
            .and_then(|f| payload.get(f))
            .and_then(|v| v.as_str().and_then(parse_hex_u64).or_else(|| v.as_u64()))
            .map(|n| n as u32);

        let timestamp = self
            .timestamp_field
            .as_ref()
            .and_then(|f| payload.get(f))
            .and_then(|v| v.as_str().and_then(parse_hex_u64).or_else(|| v.as_u64()))
            .filter(|t| *t > 0)
            .unwrap_or_else(wall_clock_fallback_secs);

        BlockEvent::new(self.network(), identifier.to_string(), height, timestamp, source, tier, None)
            .map_err(|e| RelayError::Malformed(e.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_custom_field_names() {
        let parser = GenericParser {
            network_name: "avalanche".into(),
            identifier_field: "blockHash".into(),
            height_field: Some("blockNumber".into()),
            timestamp_field: None,
        };
        let payload = serde_json::json!({"blockHash": "0xdeadbeef", "blockNumber": 42});
        let ev = parser.parse(&payload, "avax-ws-1", "FREE").unwrap();
        assert_eq!(ev.identifier, "0xdeadbeef");
        assert_eq!(ev.height, Some(42));
    }

    #[test]
    fn rejects_missing_identifier() {
        let parser = GenericParser::new("avalanche");
        assert!(parser.parse(&serde_json::json!({}), "avax-ws-1", "FREE").is_err());
    }
}
