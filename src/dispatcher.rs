//! Top-level registry of per-network relay clients: fans their block
//! streams into one deduplicated output, runs a periodic dedup-store sweep,
//! and coordinates shutdown across every registered client.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::RelayClient;
use crate::dedup::{Deduplicator, SeenOptions};
use crate::model::BlockEvent;

const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Derives the dedup item type and, where available, the slot/height to key
/// on from a normalized event. Solana's `SolanaParser` never sets `height`
/// and instead encodes the slot in `identifier` as `slot:<n>`; without this,
/// `seen()` would type every event `"block"` and Solana would never get the
/// slot TTL multiplier or slot-prefixed keying spec'd for it.
fn item_type_and_slot(event: &BlockEvent) -> (&'static str, Option<u64>) {
    if let Some(slot) = event.identifier.strip_prefix("slot:").and_then(|s| s.parse::<u64>().ok()) {
        ("slot", Some(slot))
    } else {
        ("block", event.height.map(u64::from))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("a client is already registered for network {0}")]
    DuplicateClient(String),
}

/// Owns every registered `RelayClient` plus the shared deduplicator they
/// all funnel through. Dedup is applied centrally here rather than inside
/// each client, so a block that two networks both see (cross-network mode)
/// or that a client double-delivers is only forwarded once.
pub struct Dispatcher {
    clients: DashMap<String, Arc<dyn RelayClient>>,
    dedup: Arc<Deduplicator>,
    cancel: CancellationToken,
    cleanup_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(dedup: Arc<Deduplicator>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            clients: DashMap::new(),
            dedup,
            cancel: CancellationToken::new(),
            cleanup_handle: parking_lot::Mutex::new(None),
        });
        dispatcher.spawn_cleanup_ticker();
        dispatcher
    }

    fn spawn_cleanup_ticker(self: &Arc<Self>) {
        let dedup = Arc::clone(&self.dedup);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => dedup.sweep(),
                }
            }
        });
        *self.cleanup_handle.lock() = Some(handle);
    }

    pub fn register(&self, name: impl Into<String>, client: Arc<dyn RelayClient>) -> Result<(), DispatchError> {
        let name = name.into();
        match self.clients.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DispatchError::DuplicateClient(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client);
                Ok(())
            }
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<dyn RelayClient>> {
        self.clients.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn registered_networks(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Connects every registered client and forwards their normalized
    /// blocks into `output`, deduplicated, until the dispatcher shuts down.
    pub fn stream_all(self: &Arc<Self>, output: mpsc::Sender<BlockEvent>) -> Vec<JoinHandle<()>> {
        let (merged_tx, mut merged_rx) = mpsc::channel::<BlockEvent>(1024);

        let mut handles: Vec<JoinHandle<()>> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()).stream_blocks(merged_tx.clone()))
            .collect();
        drop(merged_tx);

        let dedup = Arc::clone(&self.dedup);
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe_event = merged_rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        let (item_type, slot_or_height) = item_type_and_slot(&event);
                        let duplicate = dedup.seen(
                            &event.network,
                            &event.identifier,
                            item_type,
                            SeenOptions {
                                priority: None,
                                slot_or_height,
                                source: event.source.clone(),
                                cross_network: false,
                            },
                        );
                        if !duplicate && output.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }

    /// Disconnects every registered client sequentially, logging failures
    /// but never aborting the rest of the sweep.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.cleanup_handle.lock().take() {
            let _ = handle.await;
        }

        for entry in self.clients.iter() {
            let name = entry.key().clone();
            let client = Arc::clone(entry.value());
            info!(network = %name, "disconnecting relay client");
            client.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientMetricsSnapshot, HealthSnapshot, NetworkInfo, SyncStatus};
    use crate::config::NetworkEndpoints;
    use crate::dedup::{DedupConfig, TierGates};
    use crate::error::RelayError;
    use crate::metrics::noop_sink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubClient {
        disconnected: AtomicBool,
    }

    #[async_trait]
    impl RelayClient for StubClient {
        async fn connect(&self) -> Result<(), RelayError> {
            Ok(())
        }
        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn stream_blocks(self: Arc<Self>, _out: mpsc::Sender<BlockEvent>) -> JoinHandle<()> {
            tokio::spawn(async {})
        }
        async fn get_latest_block(&self) -> Result<BlockEvent, RelayError> {
            Err(RelayError::NoConnection)
        }
        async fn get_block_by_hash(&self, _hash: &str) -> Result<BlockEvent, RelayError> {
            Err(RelayError::NoConnection)
        }
        async fn get_block_by_height(&self, _height: u64) -> Result<BlockEvent, RelayError> {
            Err(RelayError::NoConnection)
        }
        async fn get_network_info(&self) -> Result<NetworkInfo, RelayError> {
            Ok(NetworkInfo::default())
        }
        async fn get_peer_count(&self) -> Result<u32, RelayError> {
            Ok(0)
        }
        async fn get_sync_status(&self) -> Result<SyncStatus, RelayError> {
            Ok(SyncStatus::default())
        }
        fn get_health(&self) -> HealthSnapshot {
            HealthSnapshot::default()
        }
        fn get_metrics(&self) -> ClientMetricsSnapshot {
            ClientMetricsSnapshot::default()
        }
        fn get_supported_features(&self) -> &[&'static str] {
            &[]
        }
        fn update_config(&self, _cfg: NetworkEndpoints) {}
        fn get_config(&self) -> NetworkEndpoints {
            NetworkEndpoints {
                name: "stub".into(),
                ty: crate::config::NetworkType::Generic,
                endpoints: vec![],
                timeout: std::time::Duration::from_secs(1),
                retry_attempts: 0,
                retry_delay: std::time::Duration::from_millis(1),
                max_concurrency: 1,
                buffer_size: 1,
                enable_compression: false,
                tls_cert_path: None,
                tls_key_path: None,
                rpc_url: None,
            }
        }
    }

    fn test_dedup() -> Arc<Deduplicator> {
        Arc::new(Deduplicator::new(
            DedupConfig::new("ethereum", 300, 1024),
            TierGates::free(),
            noop_sink(),
        ))
    }

    #[tokio::test]
    async fn register_rejects_duplicate_names() {
        let dispatcher = Dispatcher::new(test_dedup());
        let client: Arc<dyn RelayClient> = Arc::new(StubClient {
            disconnected: AtomicBool::new(false),
        });
        assert!(dispatcher.register("ethereum", Arc::clone(&client)).is_ok());
        assert_eq!(
            dispatcher.register("ethereum", client),
            Err(DispatchError::DuplicateClient("ethereum".to_string()))
        );
        dispatcher.shutdown().await;
    }

    #[test]
    fn item_type_and_slot_detects_solana_slot_identifiers() {
        let event = BlockEvent::new("solana", "slot:250000123", None, 1, "solana-ws-1", "FREE", None).unwrap();
        assert_eq!(item_type_and_slot(&event), ("slot", Some(250_000_123)));
    }

    #[test]
    fn item_type_and_slot_falls_back_to_block_for_other_networks() {
        let event = BlockEvent::new("bitcoin", "ab12", Some(800_000), 1, "bitcoin-p2p-1", "FREE", None).unwrap();
        assert_eq!(item_type_and_slot(&event), ("block", Some(800_000)));
    }

    #[tokio::test]
    async fn shutdown_disconnects_every_registered_client() {
        let dispatcher = Dispatcher::new(test_dedup());
        let client = Arc::new(StubClient {
            disconnected: AtomicBool::new(false),
        });
        dispatcher.register("ethereum", Arc::clone(&client) as Arc<dyn RelayClient>).unwrap();
        dispatcher.shutdown().await;
        assert!(client.disconnected.load(Ordering::SeqCst));
    }
}
