//! Sentinel trading-state backend.
//! Owns the authoritative record of open positions, closed trades, and
//! strategy performance for a Binance testnet/mainnet trading client.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_backend::config::{Cli, Config};
use sentinel_backend::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    tracing::info!(port = config.port, db_path = %config.db_path, "starting sentinel");

    let supervisor = Supervisor::bootstrap(config).await?;
    supervisor.serve().await
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
