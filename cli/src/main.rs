//! Hypo CLI - cross-device clipboard sync.

mod commands;
mod process;
mod ui;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hypo")]
#[command(about = "Cross-device clipboard sync", long_about = None)]
struct Cli {
    /// Device name to advertise
    #[arg(short, long, default_value_t = default_device_name())]
    name: String,

    /// Cloud relay WebSocket URL (wss://...)
    #[arg(long)]
    relay_url: Option<String>,

    /// Hex SHA-256 pin for the relay certificate
    #[arg(long)]
    relay_fingerprint: Option<String>,

    /// Base URL of the relay pairing HTTP API
    #[arg(long)]
    relay_api_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "hypo-device".to_string())
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hypo service (default)
    Run,
    /// Show device info
    Info,
    /// Pair with another device
    Pair {
        #[command(subcommand)]
        mode: commands::PairMode,
    },
    /// Remove a paired device
    Unpair {
        /// The peer's device id
        device_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hypo=info".parse()?)
                .add_directive("mdns_sd=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::build_config(
        cli.name,
        cli.relay_url,
        cli.relay_fingerprint,
        cli.relay_api_url,
    )?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run_service(config).await?,
        Commands::Info => commands::show_info(config).await?,
        Commands::Pair { mode } => commands::pair(config, mode).await?,
        Commands::Unpair { device_id } => commands::unpair(config, &device_id).await?,
    }

    Ok(())
}
