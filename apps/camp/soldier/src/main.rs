use anyhow::Result;
use camp_soldier::config::{Cli, SoldierConfig};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SoldierConfig::try_from(cli)?;
    camp_soldier::telemetry::init_tracing(&config.log_filter)?;
    info!(
        endpoint = %config.session.endpoint,
        instance = %config.session.identity,
        "starting camp soldier"
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("interrupt received; closing session");
        trigger.cancel();
    });

    camp_soldier::run(config, cancel).await
}
