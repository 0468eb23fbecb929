//! wgreg CLI - Main Entry Point

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wgreg_cli::commands::{apply, device, server, user};
use wgreg_cli::context::Context;
use wgreg_cli::output;

/// wgreg - WireGuard gateway registry
#[derive(Parser)]
#[command(name = "wgreg")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (defaults to ~/.wgreg/config.toml)
    #[arg(short, long, env = "WGREG_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "WGREG_STORE", global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the gateway server
    #[command(subcommand)]
    Server(server::ServerCommands),

    /// Manage users
    #[command(subcommand)]
    User(user::UserCommands),

    /// Manage devices
    #[command(subcommand)]
    Device(device::DeviceCommands),

    /// Print the interface configuration rendered from stored state
    Render,

    /// Apply stored state to the live interface
    Apply {
        /// Restart the interface instead of syncing peers in place
        #[arg(long)]
        restart: bool,
    },

    /// Compare stored state with the host
    Status,

    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("wgreg CLI v{}", wgreg_common::VERSION);
        return Ok(());
    }

    let ctx = Context::open(cli.config, cli.store)?;

    match cli.command {
        Commands::Server(cmd) => server::execute(cmd, &ctx, cli.format)?,
        Commands::User(cmd) => user::execute(cmd, &ctx, cli.format)?,
        Commands::Device(cmd) => device::execute(cmd, &ctx, cli.format)?,
        Commands::Render => apply::print_rendered(&ctx)?,
        Commands::Apply { restart } => apply::apply(&ctx, restart, cli.format)?,
        Commands::Status => apply::status(&ctx, cli.format)?,
        Commands::Version => {}
    }

    Ok(())
}
