//! Sharepool Relay Service
//!
//! Runs one block relay per configured chain and the HTTP API in front of
//! them.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use sharepool_relay::api::{self, ApiState, Metrics};
use sharepool_relay::config::{ChainConfig, RelayNodeConfig};
use sharepool_relay::registry::PeerStore;
use sharepool_relay::rpc::RpcClient;
use sharepool_relay::transport::{BlockSubmitter, TcpTransport};
use sharepool_relay::{RelayHandle, RelayIo, RelayParams};

/// Sharepool Relay - redundant block propagation for a mining-pool node
#[derive(Parser, Debug)]
#[command(name = "sharepool-relay")]
#[command(author = "Sharepool Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Redundant block-propagation overlay for a mining-pool node", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sharepool-relay.toml")]
    config: PathBuf,

    /// Data directory for peer snapshots (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API port (overrides config)
    #[arg(long)]
    api_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the default configuration to --config and exit
    #[arg(long)]
    write_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into())
        )
        .init();

    info!("🌐 Sharepool Relay v{}", env!("CARGO_PKG_VERSION"));

    if args.write_default_config {
        RelayNodeConfig::default().save(&args.config)?;
        info!("📝 Default configuration written to {:?}", args.config);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        RelayNodeConfig::load(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        RelayNodeConfig::default()
    };

    // Override config with CLI args
    let config = config
        .with_api_port(args.api_port)
        .with_data_dir(args.data_dir);

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   API port: {}", config.api_port);
    info!("   Data dir: {:?}", config.data_dir);
    for chain in &config.chains {
        info!(
            "   Chain {}: local node {}, peers {}..{}, {} extra RPC endpoints",
            chain.name,
            chain.local_p2p,
            chain.relay.min_peers,
            chain.relay.max_peers,
            chain.submit_endpoints.len()
        );
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // One relay per chain
    let mut relays = BTreeMap::new();
    for chain in &config.chains {
        let relay = start_relay(chain, &config).await?;
        relays.insert(chain.name.clone(), relay);
    }

    let metrics = Arc::new(Metrics::new());
    let state = Arc::new(ApiState {
        relays: relays.clone(),
        metrics,
    });
    let api_handle = tokio::spawn(api::run_api_server(config.api_port, state));

    info!("✅ All relays started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
    }

    // Graceful shutdown: persist stores, close peer links. Links to the
    // local nodes come back to us and stay open until the process exits.
    let mut local_links = Vec::new();
    for relay in relays.values() {
        match relay.shutdown().await {
            Ok(link) => local_links.extend(link),
            Err(e) => warn!("[{}] Shutdown failed: {}", relay.chain(), e),
        }
    }

    info!(
        "👋 Sharepool Relay shutting down ({} local node links left open)",
        local_links.len()
    );
    Ok(())
}

/// Wire up the relay for one chain
async fn start_relay(chain: &ChainConfig, config: &RelayNodeConfig) -> anyhow::Result<RelayHandle> {
    let settings = chain.relay.clone();
    let local_endpoint = chain.local_endpoint()?;

    let snapshot_path = chain.snapshot_path(&config.data_dir);
    let store = PeerStore::load(&snapshot_path, chain.valid_port_set())?;
    info!(
        "📦 [{}] Peer store at {:?} ({} peers)",
        chain.name,
        snapshot_path,
        store.len()
    );

    let local_rpc = Arc::new(
        RpcClient::new(&chain.rpc_url, settings.rpc_timeout())?
            .with_auth(&chain.rpc_user, &chain.rpc_password),
    );

    let mut submitters: Vec<Arc<dyn BlockSubmitter>> = Vec::new();
    if chain.submit_via_local_rpc {
        submitters.push(local_rpc.clone());
    }
    for endpoint in &chain.submit_endpoints {
        let client = RpcClient::new(&endpoint.url, settings.rpc_timeout())?
            .with_auth(&endpoint.rpc_user, &endpoint.rpc_password);
        submitters.push(Arc::new(client));
    }

    let io = RelayIo {
        transport: Arc::new(TcpTransport::new(chain.magic()?)),
        local_node: local_rpc,
        submitters,
    };

    let params = RelayParams {
        chain: chain.name.clone(),
        local_endpoint,
        default_port: chain.p2p_port,
        settings,
    };

    Ok(RelayHandle::spawn(params, store, io).await)
}
