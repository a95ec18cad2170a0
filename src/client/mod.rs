//! Relay client capability set: one trait implemented per network, stored
//! by the dispatcher as `Arc<dyn RelayClient>` trait objects rather than a
//! closed enum, since the registration contract needs an open set.

pub mod bitcoin;
pub mod generic;
pub mod ethereum;
pub mod jsonrpc;
pub mod solana;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NetworkEndpoints;
use crate::error::RelayError;
use crate::model::EndpointStats;
use crate::model::BlockEvent;

#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub network: String,
    pub endpoint_count: usize,
    pub connected_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub syncing: bool,
    pub current_height: Option<u64>,
    pub highest_height: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientMetricsSnapshot {
    pub blocks_relayed: u64,
    pub duplicate_rate: f64,
}

/// Capability set every per-network relay client implements. The dispatcher
/// only ever talks to `dyn RelayClient`.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn connect(&self) -> Result<(), RelayError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    /// Spawns a task forwarding every normalized block into `out` until
    /// the client disconnects; returns its handle for the caller to await
    /// or abort.
    fn stream_blocks(self: std::sync::Arc<Self>, out: mpsc::Sender<BlockEvent>) -> JoinHandle<()>;

    async fn get_latest_block(&self) -> Result<BlockEvent, RelayError>;
    async fn get_block_by_hash(&self, hash: &str) -> Result<BlockEvent, RelayError>;
    async fn get_block_by_height(&self, height: u64) -> Result<BlockEvent, RelayError>;
    async fn get_network_info(&self) -> Result<NetworkInfo, RelayError>;
    async fn get_peer_count(&self) -> Result<u32, RelayError>;
    async fn get_sync_status(&self) -> Result<SyncStatus, RelayError>;

    fn get_health(&self) -> HealthSnapshot;
    fn get_metrics(&self) -> ClientMetricsSnapshot;

    fn supports_feature(&self, feature: &str) -> bool {
        self.get_supported_features().contains(&feature)
    }
    fn get_supported_features(&self) -> &[&'static str];

    fn update_config(&self, cfg: NetworkEndpoints);
    fn get_config(&self) -> NetworkEndpoints;
}
