pub mod client;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod parser;
pub mod pool;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::eyre::{eyre, Result};
use telemetry_batteries::metrics::statsd::StatsdBattery;
use telemetry_batteries::tracing::datadog::DatadogBattery;
use telemetry_batteries::tracing::TracingShutdownHandle;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use client::RelayClient;
use config::{Config, NetworkType};
use dedup::{DedupConfig, Deduplicator, TierGates};
use dispatcher::Dispatcher;
use metrics::{BatteriesMetricsSink, MetricsSink};
use model::{BlockEvent, Tier};

#[derive(Parser, Debug)]
#[clap(name = "Relay Fabric")]
#[clap(version)]
struct Opts {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Set to disable colors in the logs
    #[clap(long)]
    no_ansi: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    eyre::install()?;
    dotenv::dotenv().ok();

    let opts = Opts::parse();
    let config = Config::load(opts.config.as_deref())?;

    let _tracing_shutdown_handle = if let Some(telemetry) = &config.telemetry {
        let tracing_shutdown_handle = DatadogBattery::init(
            telemetry.traces_endpoint.as_deref(),
            &telemetry.service_name,
            None,
            true,
        );

        if let Some(metrics_config) = &telemetry.metrics {
            StatsdBattery::init(
                &metrics_config.host,
                metrics_config.port,
                metrics_config.queue_size,
                metrics_config.buffer_size,
                Some(&metrics_config.prefix),
            )?;
        }

        tracing_shutdown_handle
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(!opts.no_ansi)
                    .pretty()
                    .compact(),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();

        TracingShutdownHandle
    };

    tracing::info!(tier = ?config.tier, networks = config.networks.len(), "starting relay fabric");

    run(config).await
}

pub async fn run(config: Config) -> Result<()> {
    let metrics: Arc<dyn MetricsSink> = Arc::new(BatteriesMetricsSink);
    let tier_str = tier_label(config.tier);

    let dedup = build_deduplicator(&config, Arc::clone(&metrics));
    let dispatcher = Dispatcher::new(dedup);

    for network in &config.networks {
        let filtered = network.filtered_endpoints(&config.placeholder_tokens);
        if filtered.is_empty() {
            tracing::warn!(network = %network.name, "no usable endpoints after placeholder filtering, skipping");
            continue;
        }
        let mut endpoints = network.clone();
        endpoints.endpoints = filtered;

        let client = build_client(endpoints, &tier_str, Arc::clone(&metrics));
        client.connect().await.map_err(|e| eyre!(e))?;
        dispatcher
            .register(network.name.clone(), client)
            .map_err(|e| eyre!(e))?;
    }

    let (tx, mut rx) = mpsc::channel::<BlockEvent>(2000);
    let stream_handles = dispatcher.stream_all(tx);

    let consume = async {
        while let Some(event) = rx.recv().await {
            tracing::info!(
                network = %event.network,
                identifier = %event.identifier,
                height = ?event.height,
                "relaying block"
            );
        }
    };

    tokio::select! {
        _ = consume => {
            tracing::error!("block event stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for handle in stream_handles {
        handle.abort();
    }
    dispatcher.shutdown().await;

    Ok(())
}

fn tier_label(tier: Tier) -> String {
    match tier {
        Tier::Free => "FREE",
        Tier::Business => "BUSINESS",
        Tier::Enterprise => "ENTERPRISE",
    }
    .to_string()
}

fn build_deduplicator(config: &Config, metrics: Arc<dyn MetricsSink>) -> Arc<Deduplicator> {
    let capacity = config.tier.default_capacity();
    let base_ttl = config.tier.default_ttl_secs_block_scale();
    let dedup_config = DedupConfig::new("all", base_ttl, capacity);
    let gates = match config.tier {
        Tier::Free => TierGates::free(),
        Tier::Business => TierGates::business(),
        Tier::Enterprise => TierGates::enterprise(),
    };
    Arc::new(Deduplicator::new(dedup_config, gates, metrics))
}

fn build_client(
    endpoints: config::NetworkEndpoints,
    tier: &str,
    metrics: Arc<dyn MetricsSink>,
) -> Arc<dyn RelayClient> {
    match endpoints.ty {
        NetworkType::Bitcoin => client::bitcoin::BitcoinRelayClient::new(endpoints, tier, metrics),
        NetworkType::Ethereum => client::ethereum::build(endpoints, tier, metrics),
        NetworkType::Solana => client::solana::build(endpoints, tier, metrics),
        NetworkType::Generic => client::generic::build(endpoints, tier, metrics),
    }
}
