use std::sync::Arc;

use crate::config::NetworkEndpoints;
use crate::metrics::MetricsSink;
use crate::parser::solana::SolanaParser;

use super::jsonrpc::{JsonRpcRelayClient, MethodSet};

const FEATURES: &[&str] = &["slot_subscribe", "get_block_by_number"];

pub fn build(config: NetworkEndpoints, tier: impl Into<String>, metrics: Arc<dyn MetricsSink>) -> Arc<JsonRpcRelayClient> {
    let methods = MethodSet {
        subscribe_method: "slotSubscribe",
        subscribe_params: serde_json::json!([]),
        notification_method: crate::notify::SOLANA_SLOT_NOTIFICATION,
        latest_block_method: "getSlot",
        latest_block_params: serde_json::json!([]),
        block_by_hash_method: "getBlock",
        block_by_number_method: "getBlock",
        peer_count_method: Some("getClusterNodes"),
        sync_status_method: None,
        features: FEATURES,
    };

    JsonRpcRelayClient::new(Arc::new(SolanaParser), methods, config, tier, metrics)
}
