use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use crate::registry::RegistryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Parser)]
#[command(
    name = "camp-commander",
    author,
    version,
    about = "Issues instructions to connected soldiers and records their replies"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "CAMP_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Where instances, instructions and queues are kept.
    #[arg(long, env = "CAMP_STORE", value_enum, default_value_t = StoreBackend::Memory)]
    pub store: StoreBackend,

    /// Redis connection URI, required with `--store redis`.
    #[arg(long, env = "CAMP_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Shared secret soldiers and API callers must present.
    #[arg(long, env = "CAMP_TOKEN")]
    pub token: Option<String>,

    /// Interval between websocket pings on each session.
    #[arg(long, env = "CAMP_PING_INTERVAL_SECS", default_value_t = 15)]
    pub ping_interval_secs: u64,

    /// A session with no inbound frame (report or pong) for this long is closed.
    #[arg(long, env = "CAMP_READ_IDLE_SECS", default_value_t = 30)]
    pub read_idle_secs: u64,

    /// Queue poll period when no wake-up arrives.
    #[arg(long, env = "CAMP_QUEUE_POLL_MS", default_value_t = 1000)]
    pub queue_poll_ms: u64,

    #[arg(long, env = "CAMP_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "CAMP_REGISTER_RETRY_SECS", default_value_t = 3)]
    pub register_retry_secs: u64,

    /// An instance is alive while its last heartbeat is younger than this.
    #[arg(long, env = "CAMP_ALIVE_WINDOW_SECS", default_value_t = 20)]
    pub alive_window_secs: u64,

    /// Fallback filter when RUST_LOG is unset.
    #[arg(long, env = "CAMP_LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "CAMP_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub queue_poll: Duration,
    pub read_idle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            queue_poll: Duration::from_secs(1),
            read_idle: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommanderConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreBackend,
    pub redis_url: Option<String>,
    pub token: Option<String>,
    pub session: SessionConfig,
    pub registry: RegistryConfig,
    pub log_filter: String,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for CommanderConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.store == StoreBackend::Redis && cli.redis_url.is_none() {
            bail!("--store redis requires --redis-url");
        }
        if cli.heartbeat_interval_secs >= cli.alive_window_secs {
            bail!(
                "heartbeat interval ({}s) must be shorter than the alive window ({}s)",
                cli.heartbeat_interval_secs,
                cli.alive_window_secs
            );
        }
        if cli.queue_poll_ms == 0 || cli.ping_interval_secs == 0 || cli.read_idle_secs == 0 {
            bail!("poll, ping and read-idle intervals must be greater than zero");
        }
        if cli.read_idle_secs <= cli.ping_interval_secs {
            bail!("--read-idle-secs must exceed --ping-interval-secs so pongs keep sessions open");
        }
        Ok(CommanderConfig {
            listen_addr,
            store: cli.store,
            redis_url: cli.redis_url,
            token: cli.token.filter(|token| !token.is_empty()),
            session: SessionConfig {
                ping_interval: Duration::from_secs(cli.ping_interval_secs),
                queue_poll: Duration::from_millis(cli.queue_poll_ms),
                read_idle: Duration::from_secs(cli.read_idle_secs),
            },
            registry: RegistryConfig {
                alive_window: Duration::from_secs(cli.alive_window_secs),
                heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
                register_retry: Duration::from_secs(cli.register_retry_secs),
            },
            log_filter: cli.log_filter,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
