//! wgrelay daemon
//!
//! Provisions WireGuard peers on a single relay host: address allocation,
//! keypair issuance, live interface synchronization, and an authenticated
//! HTTP API for the billing backend to drive.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod alloc;
mod config;
mod provision;
mod reconciler;
mod server;
mod store;
mod wg;

use config::RelayConfig;

#[derive(Parser)]
#[command(name = "wgrelayd")]
#[command(about = "wgrelay daemon - WireGuard peer provisioning")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WGRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP API port
    #[arg(short, long)]
    port: Option<u16>,

    /// WireGuard interface name
    #[arg(short, long)]
    interface: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("wgrelay daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: file, then environment, then flags
    let config_path = cli
        .config
        .unwrap_or_else(wgrelay_common::default_config_path);
    let mut config = RelayConfig::load(&config_path)?;
    config.apply_env_overrides();
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(port) = cli.port {
        config.server.api_port = port;
    }
    if let Some(interface) = cli.interface {
        config.wireguard.interface = interface;
    }
    config.validate()?;

    tokio::fs::create_dir_all(&config.store_path).await?;

    // Open the peer store
    let db = wgrelay_common::Database::open(config.db_path())?;
    let peer_store = store::PeerStore::new(db);
    peer_store.init_schema()?;

    // Runtime control via wg(8)
    let runtime = Arc::new(wg::WgCli::new(
        config.wireguard.interface.clone(),
        Duration::from_secs(config.wireguard.control_timeout_secs),
    ));

    let provisioner = Arc::new(provision::Provisioner::new(
        config.clone(),
        peer_store.clone(),
        runtime,
    )?);

    info!(
        "Relay {} on {} ({}), {} active peers",
        config.server.name,
        config.endpoint(),
        config.wireguard.subnet,
        provisioner.active_peer_count()?
    );

    // Reconcile before accepting traffic, so a crash mid-provision or an
    // interface restart does not serve stale state.
    match provisioner.reconcile().await {
        Ok(report) => {
            if !report.reapplied.is_empty() || !report.unknown.is_empty() {
                info!(
                    "Startup reconciliation: re-applied {}, flagged {} unknown",
                    report.reapplied.len(),
                    report.unknown.len()
                );
            }
        }
        Err(e) => {
            warn!("Startup reconciliation failed: {}", e);
        }
    }

    // Periodic reconciliation
    let reconciler = reconciler::Reconciler::new(
        provisioner.clone(),
        Duration::from_secs(config.reconcile.interval_secs),
    );
    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    // HTTP API
    let state = Arc::new(server::AppState::new(provisioner, config));
    let server_handle = tokio::spawn(server::serve(state));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            if let Ok(Err(e)) = result {
                tracing::error!("API server error: {}", e);
            }
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                tracing::error!("Reconciler error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
