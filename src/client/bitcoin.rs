//! Bitcoin P2P relay client: dials peers directly over TCP and speaks the
//! `version`/`verack`/`inv`/`getdata`/`block` wire protocol, rather than
//! going through the shared JSON-RPC client (Bitcoin Core's P2P port isn't
//! JSON-RPC).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Network as BtcNetwork;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::NetworkEndpoints;
use crate::error::RelayError;
use crate::health::{Registry, Selector, SharedRegistry};
use crate::metrics::MetricsSink;
use crate::model::BlockEvent;
use crate::parser::bitcoin::BitcoinParser;
use crate::parser::BlockParser;

use super::{ClientMetricsSnapshot, HealthSnapshot, NetworkInfo, RelayClient, SyncStatus};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const READ_TIMEOUT: Duration = Duration::from_secs(45);
const HEADER_LEN: usize = 24;

struct PeerConnection {
    write: tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

/// JSON-RPC 2.0 over HTTP POST, used only as a fallback for queries the P2P
/// wire protocol has no message for (`getblockhash`, `getblock`). Resolves
/// the spec's open question about `getBlockHashByHeight`: the original
/// returned a synthetic zero-padded hex; this issues the real RPC call.
async fn rpc_call(http: &reqwest::Client, rpc_url: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RelayError> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let response = http
        .post(rpc_url)
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayError::TransientNetwork(e.to_string()))?;

    let envelope: serde_json::Value = response
        .json()
        .await
        .map_err(|e| RelayError::Malformed(format!("invalid rpc response: {e}")))?;

    if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(serde_json::Value::as_i64).unwrap_or(-32603);
        let message = err.get("message").and_then(serde_json::Value::as_str).unwrap_or("rpc error").to_string();
        return Err(RelayError::Rpc { code, message });
    }

    Ok(envelope.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// Builds a `BlockEvent` from a Bitcoin Core `getblock` (verbosity 1) result.
fn parse_getblock_result(result: &serde_json::Value, source: &str, tier: &str) -> Result<BlockEvent, RelayError> {
    let hash = result
        .get("hash")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RelayError::Malformed("getblock result missing hash".into()))?;
    let height = result.get("height").and_then(serde_json::Value::as_u64).map(|h| h as u32);
    let timestamp = result.get("time").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let timestamp = if timestamp == 0 { crate::model::now_unix_ms() / 1000 } else { timestamp };

    BlockEvent::new("bitcoin", format!("0x{hash}"), height, timestamp, source, tier, None)
        .map_err(|e| RelayError::Malformed(e.0))
}

/// Shared state cloned into the dial/read-loop tasks; kept separate from
/// `BitcoinRelayClient` itself so those tasks don't need an `Arc<Self>`.
struct Shared {
    registry: SharedRegistry,
    tier: RwLock<String>,
    metrics: Arc<dyn MetricsSink>,
    peers: DashMap<String, Arc<PeerConnection>>,
    blocks_relayed: AtomicU64,
    connected: AtomicBool,
    http: reqwest::Client,
}

pub struct BitcoinRelayClient {
    shared: Arc<Shared>,
    config: RwLock<NetworkEndpoints>,
}

impl BitcoinRelayClient {
    pub fn new(config: NetworkEndpoints, tier: impl Into<String>, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                registry: Arc::new(Registry::new()),
                tier: RwLock::new(tier.into()),
                metrics,
                peers: DashMap::new(),
                blocks_relayed: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                http: reqwest::Client::new(),
            }),
            config: RwLock::new(config),
        })
    }

    fn rpc_url(&self) -> Result<String, RelayError> {
        self.config
            .read()
            .rpc_url
            .clone()
            .ok_or_else(|| RelayError::Malformed("bitcoin network has no rpc_url configured for RPC fallback".into()))
    }
}

async fn dial_peer(shared: Arc<Shared>, addr_str: String, sender: mpsc::Sender<BlockEvent>) -> Result<(), RelayError> {
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| RelayError::Malformed(format!("invalid bitcoin peer address: {addr_str}")))?;

    let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| RelayError::Timeout)?
        .map_err(|e| RelayError::TransientNetwork(e.to_string()))?;
    stream.set_nodelay(true).ok();

    let (mut read_half, mut write_half) = stream.into_split();

    let version = build_version_message(addr);
    write_message(&mut write_half, NetworkMessage::Version(version)).await?;

    // Handshake: wait for the peer's version, then verack both ways.
    timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match read_message(&mut read_half).await? {
                NetworkMessage::Version(_) => {
                    write_message(&mut write_half, NetworkMessage::Verack).await?;
                }
                NetworkMessage::Verack => return Ok::<(), RelayError>(()),
                _ => continue,
            }
        }
    })
    .await
    .map_err(|_| RelayError::Timeout)??;

    shared.peers.insert(
        addr_str.clone(),
        Arc::new(PeerConnection {
            write: tokio::sync::Mutex::new(write_half),
        }),
    );
    shared.registry.ensure(&addr_str);
    shared.registry.record_success(&addr_str, 0.0, "bitcoin", shared.metrics.as_ref());
    shared.connected.store(true, Ordering::Relaxed);

    tokio::spawn(read_loop(Arc::clone(&shared), addr_str, read_half, sender));
    Ok(())
}

async fn read_loop(
    shared: Arc<Shared>,
    peer: String,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    sender: mpsc::Sender<BlockEvent>,
) {
    let parser = BitcoinParser;
    loop {
        let message = match timeout(READ_TIMEOUT, read_message(&mut read_half)).await {
            Ok(Ok(message)) => message,
            _ => {
                shared
                    .registry
                    .record_failure(&peer, "read error or idle timeout", "bitcoin", shared.metrics.as_ref());
                shared.peers.remove(&peer);
                return;
            }
        };

        match message {
            NetworkMessage::Inv(items) => {
                let blocks: Vec<Inventory> = items
                    .into_iter()
                    .filter(|inv| matches!(inv, Inventory::Block(_) | Inventory::WitnessBlock(_)))
                    .collect();
                if blocks.is_empty() {
                    continue;
                }
                if let Some(peer_conn) = shared.peers.get(&peer) {
                    let mut guard = peer_conn.write.lock().await;
                    let _ = write_message(&mut guard, NetworkMessage::GetData(blocks)).await;
                }
            }
            // Resolved per the open question: the block message is parsed
            // inline here, synchronously, with no intermediate channel.
            NetworkMessage::Block(block) => {
                let raw = encode::serialize(&block);
                let payload = serde_json::json!({ "raw": hex::encode(raw) });
                let tier = shared.tier.read().clone();
                if let Ok(event) = parser.parse(&payload, &peer, &tier) {
                    shared.blocks_relayed.fetch_add(1, Ordering::Relaxed);
                    if sender.send(event).await.is_err() {
                        return;
                    }
                }
            }
            NetworkMessage::Ping(nonce) => {
                if let Some(peer_conn) = shared.peers.get(&peer) {
                    let mut guard = peer_conn.write.lock().await;
                    let _ = write_message(&mut guard, NetworkMessage::Pong(nonce)).await;
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RelayClient for BitcoinRelayClient {
    async fn connect(&self) -> Result<(), RelayError> {
        let endpoints = self.config.read().endpoints.clone();
        let (sink, mut drain) = mpsc::channel(64);
        // No consumer registered yet at `connect` time; drain and drop so
        // `dial_peer`'s sender doesn't block. `stream_blocks` dials its own
        // set of peer connections against the real output channel.
        tokio::spawn(async move { while drain.recv().await.is_some() {} });

        let mut last_err = None;
        for addr in endpoints {
            if let Err(e) = dial_peer(Arc::clone(&self.shared), addr, sink.clone()).await {
                last_err = Some(e);
            }
        }
        if self.shared.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(last_err.unwrap_or(RelayError::NoConnection))
        }
    }

    async fn disconnect(&self) {
        self.shared.peers.clear();
        self.shared.connected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    fn stream_blocks(self: Arc<Self>, out: mpsc::Sender<BlockEvent>) -> JoinHandle<()> {
        let endpoints = self.config.read().endpoints.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            for addr in endpoints {
                let _ = dial_peer(Arc::clone(&shared), addr, out.clone()).await;
            }
        })
    }

    async fn get_latest_block(&self) -> Result<BlockEvent, RelayError> {
        let rpc_url = self.rpc_url()?;
        let height = rpc_call(&self.shared.http, &rpc_url, "getblockcount", serde_json::json!([]))
            .await?
            .as_u64()
            .ok_or_else(|| RelayError::Malformed("getblockcount returned non-numeric result".into()))?;
        self.get_block_by_height(height).await
    }

    /// Resolved per the spec's open question: issues a real `getblock` RPC
    /// rather than returning a placeholder identifier.
    async fn get_block_by_hash(&self, hash: &str) -> Result<BlockEvent, RelayError> {
        let rpc_url = self.rpc_url()?;
        let tier = self.shared.tier.read().clone();
        let result = rpc_call(&self.shared.http, &rpc_url, "getblock", serde_json::json!([hash, 1])).await?;
        parse_getblock_result(&result, &rpc_url, &tier)
    }

    /// Resolved per the spec's open question: `getBlockHashByHeight`
    /// previously returned a synthetic zero-padded hex. This issues
    /// `getblockhash(height)` then `getblock(hash)` for real.
    async fn get_block_by_height(&self, height: u64) -> Result<BlockEvent, RelayError> {
        let rpc_url = self.rpc_url()?;
        let tier = self.shared.tier.read().clone();
        let hash = rpc_call(&self.shared.http, &rpc_url, "getblockhash", serde_json::json!([height]))
            .await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| RelayError::Malformed("getblockhash returned non-string result".into()))?;
        let result = rpc_call(&self.shared.http, &rpc_url, "getblock", serde_json::json!([hash, 1])).await?;
        parse_getblock_result(&result, &rpc_url, &tier)
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, RelayError> {
        Ok(NetworkInfo {
            network: "bitcoin".to_string(),
            endpoint_count: self.config.read().endpoints.len(),
            connected_count: self.shared.peers.len(),
        })
    }

    async fn get_peer_count(&self) -> Result<u32, RelayError> {
        Ok(self.shared.peers.len() as u32)
    }

    async fn get_sync_status(&self) -> Result<SyncStatus, RelayError> {
        Ok(SyncStatus::default())
    }

    fn get_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            endpoints: self.shared.registry.snapshot(),
        }
    }

    fn get_metrics(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            blocks_relayed: self.shared.blocks_relayed.load(Ordering::Relaxed),
            duplicate_rate: 0.0,
        }
    }

    fn get_supported_features(&self) -> &[&'static str] {
        &["inv_getdata_block", "ping_pong"]
    }

    fn update_config(&self, cfg: NetworkEndpoints) {
        *self.config.write() = cfg;
    }

    fn get_config(&self) -> NetworkEndpoints {
        self.config.read().clone()
    }
}

fn build_version_message(receiver: SocketAddr) -> VersionMessage {
    let sender_addr = Address::new(&receiver, ServiceFlags::NONE);
    let receiver_addr = Address::new(&receiver, ServiceFlags::NONE);
    VersionMessage::new(
        ServiceFlags::NONE,
        crate::model::now_unix_ms() as i64 / 1000,
        receiver_addr,
        sender_addr,
        rand::random(),
        "relay-fabric:0.1.0".to_string(),
        0,
    )
}

async fn write_message(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    message: NetworkMessage,
) -> Result<(), RelayError> {
    let raw = RawNetworkMessage::new(BtcNetwork::Bitcoin.magic(), message);
    let bytes = encode::serialize(&raw);
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| RelayError::TransientNetwork(e.to_string()))
}

async fn read_message(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> Result<NetworkMessage, RelayError> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| RelayError::TransientNetwork(e.to_string()))?;

    let payload_len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
    buf.extend_from_slice(&header);
    buf.resize(HEADER_LEN + payload_len, 0);
    reader
        .read_exact(&mut buf[HEADER_LEN..])
        .await
        .map_err(|e| RelayError::TransientNetwork(e.to_string()))?;

    let raw: RawNetworkMessage =
        encode::deserialize(&buf).map_err(|e| RelayError::Malformed(format!("invalid p2p frame: {e}")))?;
    Ok(raw.payload().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_message_carries_our_user_agent() {
        let addr: SocketAddr = "127.0.0.1:8333".parse().unwrap();
        let version = build_version_message(addr);
        assert_eq!(version.user_agent, "relay-fabric:0.1.0");
    }

    #[test]
    fn parses_getblock_result_into_block_event() {
        let result = serde_json::json!({
            "hash": "00000000000000000000abc0000000000000000000000000000000000000001",
            "height": 800_000,
            "time": 1_700_000_000u64,
        });
        let event = parse_getblock_result(&result, "https://rpc.example", "FREE").unwrap();
        assert_eq!(event.height, Some(800_000));
        assert_eq!(event.timestamp, 1_700_000_000);
        assert!(event.identifier.starts_with("0x"));
    }

    #[test]
    fn parses_getblock_result_missing_hash_is_malformed() {
        let err = parse_getblock_result(&serde_json::json!({}), "https://rpc.example", "FREE").unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }

    #[tokio::test]
    async fn get_block_by_height_fails_without_configured_rpc_url() {
        let client = BitcoinRelayClient::new(
            NetworkEndpoints {
                name: "bitcoin".into(),
                ty: crate::config::NetworkType::Bitcoin,
                endpoints: vec![],
                timeout: Duration::from_secs(1),
                retry_attempts: 0,
                retry_delay: Duration::from_millis(1),
                max_concurrency: 1,
                buffer_size: 1,
                enable_compression: false,
                tls_cert_path: None,
                tls_key_path: None,
                rpc_url: None,
            },
            "FREE",
            crate::metrics::noop_sink(),
        );
        let err = client.get_block_by_height(1).await.unwrap_err();
        assert!(matches!(err, RelayError::Malformed(_)));
    }
}
