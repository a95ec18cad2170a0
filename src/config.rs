//! Configuration layer: an optional file source, then an environment source
//! (`__`-separated, type-parsing enabled), deserialized through
//! `serde_path_to_error` so a bad field points at its exact path instead of
//! a generic "invalid config".

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{NetworkPolicy, OptimizationLevel, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tier: Tier,
    #[serde(default)]
    pub networks: Vec<NetworkEndpoints>,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default = "default::placeholder_tokens")]
    pub placeholder_tokens: Vec<String>,
}

impl Config {
    pub fn load(config_path: Option<&Path>) -> eyre::Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = config_path {
            settings = settings.add_source(config::File::from(path).required(true));
        }

        let settings = settings
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = serde_path_to_error::deserialize(settings)?;
        Ok(config)
    }

    /// Endpoints for `network`, with placeholder credentials filtered out
    /// (literal `YOUR_..._KEY`, `demo`, `changeme`, `your-`).
    pub fn filtered_endpoints(&self, network: &str) -> Vec<String> {
        self.networks
            .iter()
            .find(|n| n.name == network)
            .map(|n| n.filtered_endpoints(&self.placeholder_tokens))
            .unwrap_or_default()
    }
}

/// A network-keyed endpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEndpoints {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: NetworkType,
    /// Ordered list of URLs; ws/wss/http/https.
    pub endpoints: Vec<String>,
    #[serde(default = "default::timeout_secs", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default::retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default::retry_delay_ms", with = "duration_millis")]
    pub retry_delay: Duration,
    #[serde(default = "default::max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default::buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub enable_compression: bool,
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    /// HTTP JSON-RPC endpoint used as a fallback for queries the primary
    /// transport can't answer directly (Bitcoin P2P has no `getblockhash`;
    /// Generic network-info queries go over HTTP POST rather than the
    /// WebSocket subscription transport).
    #[serde(default)]
    pub rpc_url: Option<String>,
}

impl NetworkEndpoints {
    pub fn filtered_endpoints(&self, placeholder_tokens: &[String]) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|url| {
                !placeholder_tokens
                    .iter()
                    .any(|tok| url.to_ascii_lowercase().contains(&tok.to_ascii_lowercase()))
            })
            .cloned()
            .collect()
    }

    /// Static per-network priority used only for eviction.
    pub fn static_priority(&self) -> i32 {
        match self.ty {
            NetworkType::Bitcoin => 10,
            NetworkType::Ethereum => 8,
            NetworkType::Solana => 6,
            NetworkType::Generic => 4,
        }
    }

    pub fn dedup_policy(&self, tier: Tier, cross_network: bool) -> NetworkPolicy {
        let ttl_secs = match self.ty {
            NetworkType::Solana => tier.default_ttl_secs_slot_scale(),
            _ => tier.default_ttl_secs_block_scale(),
        };
        NetworkPolicy {
            ttl_secs,
            capacity: tier.default_capacity(),
            priority: self.static_priority(),
            optimization_level: self.optimization_level(tier),
            cross_network,
        }
    }

    fn optimization_level(&self, tier: Tier) -> OptimizationLevel {
        match tier {
            Tier::Enterprise => OptimizationLevel::Turbo,
            Tier::Business => OptimizationLevel::Pro,
            Tier::Free => OptimizationLevel::Standard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Bitcoin,
    Ethereum,
    Solana,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub traces_endpoint: Option<String>,
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
    pub queue_size: usize,
    pub buffer_size: usize,
    pub prefix: String,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod default {
    use std::time::Duration;

    pub fn timeout_secs() -> Duration {
        Duration::from_secs(20)
    }

    pub const fn retry_attempts() -> u32 {
        6
    }

    pub fn retry_delay_ms() -> Duration {
        Duration::from_millis(500)
    }

    pub const fn max_concurrency() -> usize {
        4
    }

    pub const fn buffer_size() -> usize {
        1500
    }

    pub fn placeholder_tokens() -> Vec<String> {
        vec![
            "YOUR_".to_string(),
            "_KEY".to_string(),
            "demo".to_string(),
            "changeme".to_string(),
            "your-".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoints() -> NetworkEndpoints {
        NetworkEndpoints {
            name: "ethereum".into(),
            ty: NetworkType::Ethereum,
            endpoints: vec![
                "wss://mainnet.example/ws/YOUR_API_KEY".into(),
                "wss://mainnet.example/ws/demo".into(),
                "wss://mainnet.example/ws/real-token-abc123".into(),
            ],
            timeout: Duration::from_secs(20),
            retry_attempts: 6,
            retry_delay: Duration::from_millis(500),
            max_concurrency: 4,
            buffer_size: 1500,
            enable_compression: false,
            tls_cert_path: None,
            tls_key_path: None,
            rpc_url: None,
        }
    }

    #[test]
    fn filters_placeholder_endpoints() {
        let endpoints = sample_endpoints();
        let tokens = default::placeholder_tokens();
        let filtered = endpoints.filtered_endpoints(&tokens);
        assert_eq!(filtered, vec!["wss://mainnet.example/ws/real-token-abc123".to_string()]);
    }

    #[test]
    fn static_priorities_rank_by_network() {
        let mut e = sample_endpoints();
        assert_eq!(e.static_priority(), 8);
        e.ty = NetworkType::Bitcoin;
        assert_eq!(e.static_priority(), 10);
        e.ty = NetworkType::Solana;
        assert_eq!(e.static_priority(), 6);
    }

    #[test]
    fn dedup_policy_uses_slot_scale_ttl_for_solana() {
        let mut e = sample_endpoints();
        e.ty = NetworkType::Solana;
        let policy = e.dedup_policy(Tier::Enterprise, false);
        assert_eq!(policy.ttl_secs, 45);
        assert_eq!(policy.capacity, 16384);
    }

    #[test]
    fn dedup_policy_uses_block_scale_ttl_otherwise() {
        let policy = sample_endpoints().dedup_policy(Tier::Free, false);
        assert_eq!(policy.ttl_secs, 5 * 60);
    }
}
