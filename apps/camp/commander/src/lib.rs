//! Commander: accepts soldier websocket sessions, issues instructions to them
//! and records the replies.

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod ledger_redis;
pub mod orchestrator;
pub mod queue;
pub mod queue_redis;
pub mod registry;
pub mod registry_redis;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::state::AppState;

/// Serves the commander on an already bound listener until `shutdown`
/// resolves, then cancels every open session and waits for them to finish,
/// at most `shutdown_grace`.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let sessions = state.sessions();
    let grace = state.shutdown_grace();
    let app = routes::router(state);

    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(%local_addr, "camp commander listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let sessions = sessions.clone();
        async move {
            shutdown.await;
            sessions.cancel_all();
        }
    })
    .await
    .context("server shutdown with error")?;

    // Upgraded websockets are detached from axum's graceful shutdown.
    info!(open = sessions.len(), grace_seconds = grace.as_secs_f64(), "draining sessions");
    if tokio::time::timeout(grace, sessions.drain()).await.is_err() {
        warn!(open = sessions.len(), "sessions still open after shutdown grace");
    }
    Ok(())
}
