//! wgreg Daemon
//!
//! Brings the gateway interface up from stored state on start and keeps it
//! reconciled while users and devices come and go.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgreg_common::{Controller, Database, RegistryConfig};

mod reconciler;

use reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "wgregd")]
#[command(about = "wgreg daemon - keeps the WireGuard gateway in sync with the registry")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ~/.wgreg/config.toml)
    #[arg(short, long, env = "WGREG_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "WGREG_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Run the startup apply and exit
    #[arg(long)]
    once: bool,
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

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("wgreg daemon v{}", wgreg_common::VERSION);

    // Load configuration
    let config_path = cli.config.unwrap_or_else(RegistryConfig::default_path);
    let mut config = RegistryConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    let db = Database::open(config.db_path())?;

    if !config.wireguard.manage_interface {
        info!("Interface management is disabled, not touching the host");
        if !cli.once {
            tokio::signal::ctrl_c().await?;
        }
        return Ok(());
    }

    let driver = config.wireguard.driver();
    let controller = Arc::new(Controller::new(Arc::new(db), Arc::new(driver)));
    let reconciler = Reconciler::new(
        controller,
        Duration::from_secs(config.reconcile_interval_secs),
    );

    // A failed startup apply leaves the gateway in an unknown state; stop here
    reconciler.startup().await?;

    if cli.once {
        info!("Startup apply complete");
        return Ok(());
    }

    let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
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
