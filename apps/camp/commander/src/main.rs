use std::sync::Arc;

use anyhow::{Context, Result};
use camp_commander::clock::SystemClock;
use camp_commander::config::{Cli, CommanderConfig};
use camp_commander::state::AppState;
use camp_commander::store::Stores;
use camp_commander::telemetry::Telemetry;
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CommanderConfig::try_from(cli)?;
    let telemetry = Telemetry::init(&config.log_filter)?;
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        auth = config.token.is_some(),
        "starting camp commander"
    );

    let stores = Stores::connect(&config).await?;
    let state = AppState::new(
        &config,
        stores,
        Arc::new(SystemClock),
        Some(telemetry.metrics_handle()),
    );
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    camp_commander::serve(listener, state, shutdown_signal()).await?;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
