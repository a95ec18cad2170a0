//! Shared JSON-RPC-over-WebSocket relay client, parameterized per network.
//! Ethereum, Solana, and the generic network all speak JSON-RPC 2.0 over a
//! WebSocket connection, so they share this implementation and differ only
//! in method names, subscription shape, and parser.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NetworkEndpoints;
use crate::connection::{ConnectionManager, ManagerConfig};
use crate::error::RelayError;
use crate::health::{Registry, Selector, SharedRegistry};
use crate::metrics::MetricsSink;
use crate::model::BlockEvent;
use crate::notify::NotificationRouter;
use crate::parser::BlockParser;

use super::{ClientMetricsSnapshot, HealthSnapshot, NetworkInfo, RelayClient, SyncStatus};

/// The handful of method names/shapes that differ between the JSON-RPC
/// networks sharing this client.
pub struct MethodSet {
    pub subscribe_method: &'static str,
    pub subscribe_params: Value,
    pub notification_method: &'static str,
    pub latest_block_method: &'static str,
    pub latest_block_params: Value,
    pub block_by_hash_method: &'static str,
    pub block_by_number_method: &'static str,
    pub peer_count_method: Option<&'static str>,
    pub sync_status_method: Option<&'static str>,
    pub features: &'static [&'static str],
}

pub struct JsonRpcRelayClient {
    network: String,
    tier: RwLock<String>,
    registry: SharedRegistry,
    router: Arc<NotificationRouter>,
    parser: Arc<dyn BlockParser>,
    methods: MethodSet,
    metrics: Arc<dyn MetricsSink>,
    managers: DashMap<String, Arc<ConnectionManager>>,
    config: RwLock<NetworkEndpoints>,
    blocks_relayed: AtomicU64,
    connected: AtomicBool,
    /// Used for request/response RPCs when `config.rpc_url` is set: the
    /// Generic network's queries go over JSON-RPC 2.0/HTTP POST rather than
    /// the WebSocket subscription transport (§6); Ethereum/Solana leave
    /// `rpc_url` unset and always call over the WS connection manager.
    http: reqwest::Client,
}

impl JsonRpcRelayClient {
    pub fn new(
        parser: Arc<dyn BlockParser>,
        methods: MethodSet,
        config: NetworkEndpoints,
        tier: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let network = parser.network().to_string();
        Arc::new(Self {
            network,
            tier: RwLock::new(tier.into()),
            registry: Arc::new(Registry::new()),
            router: NotificationRouter::new(),
            parser,
            methods,
            metrics,
            managers: DashMap::new(),
            config: RwLock::new(config),
            blocks_relayed: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            http: reqwest::Client::new(),
        })
    }

    fn selected_manager(&self) -> Result<Arc<ConnectionManager>, RelayError> {
        let url = Selector::pick_weighted(&self.registry).ok_or(RelayError::NoConnection)?;
        self.managers.get(&url).map(|e| Arc::clone(e.value())).ok_or(RelayError::NoConnection)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        if let Some(rpc_url) = self.config.read().rpc_url.clone() {
            return self.call_http(&rpc_url, method, params).await;
        }
        self.selected_manager()?.call(method, params).await
    }

    /// JSON-RPC 2.0 over HTTP POST, for networks configured with an
    /// `rpc_url` instead of (or alongside) a WebSocket subscription.
    async fn call_http(&self, rpc_url: &str, method: &str, params: Value) -> Result<Value, RelayError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::TransientNetwork(e.to_string()))?;

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| RelayError::Malformed(format!("invalid rpc response: {e}")))?;

        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = err.get("message").and_then(Value::as_str).unwrap_or("rpc error").to_string();
            return Err(RelayError::Rpc { code, message });
        }

        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RelayClient for JsonRpcRelayClient {
    async fn connect(&self) -> Result<(), RelayError> {
        // Placeholder-credential filtering happens once, earlier, when the
        // dispatcher builds this client's `NetworkEndpoints` from `Config`.
        let endpoints = self.config.read().endpoints.clone();
        let mut last_err = None;
        for url in endpoints {
            let manager = ConnectionManager::new(
                url.clone(),
                self.network.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.router),
                Arc::clone(&self.metrics),
                ManagerConfig::default(),
            );
            match manager.connect().await {
                Ok(()) => {
                    let _ = manager
                        .call(self.methods.subscribe_method, self.methods.subscribe_params.clone())
                        .await;
                    self.managers.insert(url, Arc::clone(&manager));
                    let registry = Arc::clone(&self.registry);
                    let manager_for_reconnect = Arc::clone(&manager);
                    tokio::spawn(async move {
                        let registry = registry;
                        manager_for_reconnect
                            .run_with_reconnect(move || registry.snapshot().iter().filter(|s| s.error_count == 0).count())
                            .await;
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        let any_connected = self.managers.iter().any(|m| m.value().is_connected());
        self.connected.store(any_connected, Ordering::Relaxed);
        if any_connected {
            Ok(())
        } else {
            Err(last_err.unwrap_or(RelayError::NoConnection))
        }
    }

    async fn disconnect(&self) {
        for entry in self.managers.iter() {
            entry.value().shutdown();
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn stream_blocks(self: Arc<Self>, out: mpsc::Sender<BlockEvent>) -> JoinHandle<()> {
        let mut notifications = self.router.subscribe(self.methods.notification_method);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let payload = notification
                    .params
                    .get("result")
                    .cloned()
                    .unwrap_or(notification.params);
                let tier = self.tier.read().clone();
                match self.parser.parse(&payload, &format!("{}-subscription", self.network), &tier) {
                    Ok(event) => {
                        self.blocks_relayed.fetch_add(1, Ordering::Relaxed);
                        if out.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => continue,
                }
            }
        })
    }

    async fn get_latest_block(&self) -> Result<BlockEvent, RelayError> {
        let result = self
            .call(self.methods.latest_block_method, self.methods.latest_block_params.clone())
            .await?;
        let tier = self.tier.read().clone();
        self.parser.parse(&result, &self.network, &tier)
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<BlockEvent, RelayError> {
        let params = serde_json::json!([hash, true]);
        let result = self.call(self.methods.block_by_hash_method, params).await?;
        let tier = self.tier.read().clone();
        self.parser.parse(&result, &self.network, &tier)
    }

    async fn get_block_by_height(&self, height: u64) -> Result<BlockEvent, RelayError> {
        let params = serde_json::json!([format!("0x{height:x}"), true]);
        let result = self.call(self.methods.block_by_number_method, params).await?;
        let tier = self.tier.read().clone();
        self.parser.parse(&result, &self.network, &tier)
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, RelayError> {
        Ok(NetworkInfo {
            network: self.network.clone(),
            endpoint_count: self.managers.len(),
            connected_count: self.managers.iter().filter(|m| m.value().is_connected()).count(),
        })
    }

    async fn get_peer_count(&self) -> Result<u32, RelayError> {
        let Some(method) = self.methods.peer_count_method else {
            return Ok(self.managers.len() as u32);
        };
        let result = self.call(method, Value::Array(vec![])).await?;
        result
            .as_str()
            .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .or_else(|| result.as_u64().map(|n| n as u32))
            .ok_or_else(|| RelayError::Malformed("non-numeric peer count".into()))
    }

    async fn get_sync_status(&self) -> Result<SyncStatus, RelayError> {
        let Some(method) = self.methods.sync_status_method else {
            return Ok(SyncStatus::default());
        };
        let result = self.call(method, Value::Array(vec![])).await?;
        if result.as_bool() == Some(false) {
            return Ok(SyncStatus {
                syncing: false,
                ..Default::default()
            });
        }
        Ok(SyncStatus {
            syncing: true,
            current_height: result.get("currentBlock").and_then(Value::as_u64),
            highest_height: result.get("highestBlock").and_then(Value::as_u64),
        })
    }

    fn get_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            endpoints: self.registry.snapshot(),
        }
    }

    fn get_metrics(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            blocks_relayed: self.blocks_relayed.load(Ordering::Relaxed),
            duplicate_rate: 0.0,
        }
    }

    fn get_supported_features(&self) -> &[&'static str] {
        self.methods.features
    }

    fn update_config(&self, cfg: NetworkEndpoints) {
        *self.config.write() = cfg;
    }

    fn get_config(&self) -> NetworkEndpoints {
        self.config.read().clone()
    }
}
