use std::sync::Arc;

use crate::config::NetworkEndpoints;
use crate::metrics::MetricsSink;
use crate::parser::generic::GenericParser;

use super::jsonrpc::{JsonRpcRelayClient, MethodSet};

const FEATURES: &[&str] = &["subscribe_new_heads", "get_block_by_hash", "get_block_by_number"];

pub fn build(
    config: NetworkEndpoints,
    tier: impl Into<String>,
    metrics: Arc<dyn MetricsSink>,
) -> Arc<JsonRpcRelayClient> {
    let methods = MethodSet {
        subscribe_method: "eth_subscribe",
        subscribe_params: serde_json::json!(["newHeads"]),
        notification_method: crate::notify::ETH_SUBSCRIPTION,
        latest_block_method: "eth_getBlockByNumber",
        latest_block_params: serde_json::json!(["latest", true]),
        block_by_hash_method: "eth_getBlockByHash",
        block_by_number_method: "eth_getBlockByNumber",
        peer_count_method: None,
        sync_status_method: None,
        features: FEATURES,
    };

    let parser = Arc::new(GenericParser::new(config.name.clone()));
    JsonRpcRelayClient::new(parser, methods, config, tier, metrics)
}
