//! Soldier: holds a session open to the commander, runs the instructions it
//! receives and reports the results.

pub mod agent;
pub mod config;
pub mod executor;
pub mod session;
pub mod telemetry;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::Agent;
use crate::config::SoldierConfig;
use crate::executor::ExecutorRegistry;
use crate::session::{Session, SessionError};

/// Runs the soldier until `cancel` fires.
pub async fn run(config: SoldierConfig, cancel: CancellationToken) -> Result<()> {
    let executors = ExecutorRegistry::standard(&config.executors)
        .context("failed to build executors")?;
    let agent = Agent::new(executors, config.max_concurrent, config.hello_interval);
    run_with_agent(config, agent, cancel).await
}

/// Like [`run`] with a caller-supplied agent.
pub async fn run_with_agent(
    config: SoldierConfig,
    agent: Agent,
    cancel: CancellationToken,
) -> Result<()> {
    let identity = config.session.identity.clone();
    let mut session = match Session::open(config.session, cancel.clone()).await {
        Ok(session) => session,
        Err(SessionError::Cancelled) => return Ok(()),
        Err(err) => return Err(err).context("failed to open session"),
    };
    info!(instance = %identity, "soldier session established");

    let frames = session
        .take_frames()
        .context("session inbound stream already taken")?;
    agent.run(frames, session.sender(), cancel).await;

    session.shutdown().await;
    info!(instance = %identity, "soldier session closed");
    Ok(())
}
