use std::time::Duration;

use anyhow::{bail, Context};
use camp_core::AgentIdentity;
use clap::Parser;
use url::Url;

use crate::executor::ExecutorConfig;
use crate::session::SessionOptions;

#[derive(Debug, Parser)]
#[command(
    name = "camp-soldier",
    author,
    version,
    about = "Keeps a session open to the commander and executes its instructions"
)]
pub struct Cli {
    /// Commander websocket endpoint, e.g. ws://commander:8080/connect.
    #[arg(long, env = "CAMP_URL")]
    pub url: String,

    /// Shared secret presented in the `token` header.
    #[arg(long, env = "CAMP_TOKEN")]
    pub token: Option<String>,

    #[arg(long, env = "CAMP_ORG_UUID")]
    pub org_uuid: String,

    #[arg(long, env = "CAMP_GROUP_UUID")]
    pub group_uuid: String,

    #[arg(long, env = "CAMP_INSTANCE_NAME")]
    pub instance_name: String,

    /// Delay between connection attempts.
    #[arg(long, env = "CAMP_RETRY_DELAY_MS", default_value_t = 2000)]
    pub retry_delay_ms: u64,

    /// Interval between hello echo reports.
    #[arg(long, env = "CAMP_HELLO_INTERVAL_SECS", default_value_t = 5)]
    pub hello_interval_secs: u64,

    #[arg(long, env = "CAMP_COMMAND_TIMEOUT_SECS", default_value_t = 300)]
    pub command_timeout_secs: u64,

    #[arg(long, env = "CAMP_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Echo requests sent per ICMP instruction.
    #[arg(long, env = "CAMP_PING_COUNT", default_value_t = 4)]
    pub ping_count: u32,

    /// DevTools HTTP endpoint of the browser used for page inspection.
    #[arg(long, env = "CAMP_BROWSER_ENDPOINT", default_value = "http://127.0.0.1:9222")]
    pub browser_endpoint: String,

    #[arg(long, env = "CAMP_BROWSER_TIMEOUT_SECS", default_value_t = 60)]
    pub browser_timeout_secs: u64,

    /// Instructions executed at the same time.
    #[arg(long, env = "CAMP_MAX_CONCURRENT", default_value_t = 4)]
    pub max_concurrent: usize,

    /// Fallback filter when RUST_LOG is unset.
    #[arg(long, env = "CAMP_LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct SoldierConfig {
    pub session: SessionOptions,
    pub hello_interval: Duration,
    pub max_concurrent: usize,
    pub executors: ExecutorConfig,
    pub log_filter: String,
}

impl TryFrom<Cli> for SoldierConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let endpoint =
            Url::parse(&cli.url).with_context(|| format!("invalid commander url: {}", cli.url))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            bail!("commander url must use ws:// or wss://, got {}", cli.url);
        }
        let identity = AgentIdentity::new(cli.org_uuid, cli.group_uuid, cli.instance_name)
            .context("invalid soldier identity")?;
        let browser_endpoint = Url::parse(&cli.browser_endpoint)
            .with_context(|| format!("invalid browser endpoint: {}", cli.browser_endpoint))?;
        if cli.max_concurrent == 0 {
            bail!("--max-concurrent must be at least 1");
        }
        if cli.hello_interval_secs == 0 {
            bail!("--hello-interval-secs must be greater than zero");
        }

        Ok(SoldierConfig {
            session: SessionOptions::new(endpoint, identity)
                .with_token(cli.token.filter(|token| !token.is_empty()))
                .with_retry_delay(Duration::from_millis(cli.retry_delay_ms)),
            hello_interval: Duration::from_secs(cli.hello_interval_secs),
            max_concurrent: cli.max_concurrent,
            executors: ExecutorConfig {
                command_timeout: Duration::from_secs(cli.command_timeout_secs),
                http_timeout: Duration::from_secs(cli.http_timeout_secs),
                ping_count: cli.ping_count.max(1),
                browser_endpoint,
                browser_timeout: Duration::from_secs(cli.browser_timeout_secs),
            },
            log_filter: cli.log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<SoldierConfig> {
        let mut argv = vec![
            "camp-soldier",
            "--url",
            "ws://127.0.0.1:8080/connect",
            "--org-uuid",
            "org",
            "--group-uuid",
            "grp",
            "--instance-name",
            "node-1",
        ];
        argv.extend_from_slice(extra);
        SoldierConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.session.retry_delay, Duration::from_secs(2));
        assert_eq!(config.hello_interval, Duration::from_secs(5));
        assert_eq!(config.executors.ping_count, 4);
        assert_eq!(config.executors.browser_timeout, Duration::from_secs(60));
        assert_eq!(config.session.identity.instance_name, "node-1");
    }

    #[test_timeout::timeout]
    fn connect_url_carries_identity() {
        let config = parse(&["--token", "s3cret"]).unwrap();
        let url = config.session.connect_url();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("orgUuid".into(), "org".into())));
        assert!(pairs.contains(&("groupUuid".into(), "grp".into())));
        assert!(pairs.contains(&("instanceName".into(), "node-1".into())));
        assert_eq!(config.session.token.as_deref(), Some("s3cret"));
    }

    #[test_timeout::timeout]
    fn rejects_http_scheme_and_zero_concurrency() {
        let mut argv = vec!["camp-soldier", "--url", "http://x/connect"];
        argv.extend_from_slice(&["--org-uuid", "o", "--group-uuid", "g", "--instance-name", "i"]);
        assert!(SoldierConfig::try_from(Cli::try_parse_from(argv).unwrap()).is_err());
        assert!(parse(&["--max-concurrent", "0"]).is_err());
    }
}
