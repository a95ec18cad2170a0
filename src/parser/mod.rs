//! Per-network payload parsers: raw JSON-RPC/P2P payloads in, a validated
//! `BlockEvent` out. Each parser owns its network's hash/hex/slot quirks so
//! the connection and dispatcher layers never branch on network type.

pub mod bitcoin;
pub mod ethereum;
pub mod generic;
pub mod solana;

use crate::error::RelayError;
use crate::model::BlockEvent;

pub trait BlockParser: Send + Sync {
    /// Network name this parser handles, e.g. `"bitcoin"`.
    fn network(&self) -> &str;

    /// Parse a single decoded notification/RPC-result payload into a
    /// canonical event. `source` is the endpoint URL the payload came from.
    fn parse(&self, payload: &serde_json::Value, source: &str, tier: &str) -> Result<BlockEvent, RelayError>;
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn wall_clock_fallback_secs() -> u64 {
    crate::model::now_unix_ms() / 1000
}
