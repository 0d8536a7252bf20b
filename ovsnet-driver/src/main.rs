//! ovsnet-driver
//!
//! Remote network driver daemon: keeps a cache of the switch database, restores
//! bridges removed behind its back and serves the driver API on a unix socket.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use ovsnet_core::{cancellation, DriverConfig, OvsdbEndpoint};
use ovsnet_network::{
    watcher, BridgeManager, GatewayCoordinator, Iptables, NetworkDriver, RtnetlinkLinks,
    SystemdServices,
};
use ovsnet_ovsdb::protocol::DATABASE;
use ovsnet_ovsdb::{sync, ContextCache, DbCache, OvsdbClient};

mod api;
mod server;

#[derive(Parser, Debug)]
#[command(name = "ovsnet-driver")]
#[command(about = "Open vSwitch remote network driver")]
struct Args {
    /// Switch database endpoint (tcp:host:port or unix:/path)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Unix socket to serve the driver API on
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("ovsnet_driver=info".parse()?)
        .add_directive("ovsnet_network=info".parse()?)
        .add_directive("ovsnet_ovsdb=info".parse()?);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load environment from OVSNET_ENV_FILE, /etc/ovsnet/environment or .env
    let env_file = ovsnet_core::config::load_environment();
    init_tracing(args.log_json)?;
    if let Some(path) = env_file {
        info!("Loaded environment from {}", path);
    }

    let mut config = DriverConfig::from_env();
    if let Some(endpoint) = &args.endpoint {
        config.ovsdb_endpoint = endpoint
            .parse::<OvsdbEndpoint>()
            .context("Invalid --endpoint")?;
    }
    if let Some(socket) = args.socket {
        config.plugin_socket = socket;
    }

    let (shutdown, cancel) = cancellation();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    // --- 1. Switch database ---
    let client = OvsdbClient::connect_with_retry(
        &config.ovsdb_endpoint,
        config.rpc_timeout,
        &config.connect_retry,
        &cancel,
    )
    .await
    .with_context(|| format!("Could not connect to openvswitch at {}", config.ovsdb_endpoint))?;
    info!("Connected to openvswitch at {}", config.ovsdb_endpoint);

    let databases = client.list_dbs().await.context("list_dbs failed")?;
    if !databases.iter().any(|db| db == DATABASE) {
        anyhow::bail!("Server at {} does not serve {} (has {:?})", config.ovsdb_endpoint, DATABASE, databases);
    }
    let client = Arc::new(client);

    let cache = DbCache::new();
    let contexts = ContextCache::new();
    let (forward, updates) = mpsc::unbounded_channel();
    let sync_handle = sync::start(
        client.clone(),
        cache.clone(),
        &contexts,
        Some(forward),
        &config.root_poll,
        &cancel,
    )
    .await
    .context("Failed to synchronize the OVSDB cache")?;
    info!("OVSDB cache synchronized, {} container contexts", contexts.len().await);

    // --- 2. Driver components ---
    let script = config.gateway_script.to_string_lossy().to_string();
    let services = Arc::new(SystemdServices::new(config.gateway_unit.clone(), &script));
    let gateway = Arc::new(GatewayCoordinator::new(services, &script));
    let bridges = Arc::new(BridgeManager::new(
        client,
        cache,
        Arc::new(RtnetlinkLinks::new()),
        Arc::new(Iptables::default()),
        gateway,
        config.link_poll.clone(),
        cancel.clone(),
    ));
    let driver = Arc::new(NetworkDriver::new(bridges.clone()));

    let mut watcher_task = watcher::spawn(bridges, updates, cancel.clone());

    // --- 3. Driver API ---
    // the watcher only stops early when the database connection is gone
    let listener = server::bind(&config.plugin_socket)?;
    let result = tokio::select! {
        result = server::serve(listener, &config.plugin_socket, api::router(driver), cancel.clone()) => result,
        _ = &mut watcher_task => {
            if cancel.is_cancelled() {
                Ok(())
            } else {
                error!("Lost the OVSDB update stream, shutting down");
                Err(anyhow::anyhow!("OVSDB connection to {} lost", config.ovsdb_endpoint))
            }
        }
    };

    sync_handle.abort();
    watcher_task.abort();
    info!("ovsnet-driver stopped");
    result
}
