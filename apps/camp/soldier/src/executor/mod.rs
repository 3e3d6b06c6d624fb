//! Capability executors: one per instruction type.
//!
//! The agent never looks inside an executor; it picks one by
//! [`InstructionType`] and turns the result into a reply. Every executor bounds
//! its own running time.

mod browser;
mod command;
mod dns;
mod http;
mod icmp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camp_core::{InstructionType, ReplyPayload};
use thiserror::Error;
use url::Url;

pub use browser::BrowserExecutor;
pub use command::CommandExecutor;
pub use dns::DnsExecutor;
pub use http::HttpExecutor;
pub use icmp::{parse_ping_output, IcmpExecutor};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no executor registered for {0}")]
    Unsupported(InstructionType),
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> InstructionType;

    async fn execute(&self, content: &str) -> Result<ReplyPayload, ExecutorError>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub command_timeout: Duration,
    pub http_timeout: Duration,
    pub ping_count: u32,
    pub browser_endpoint: Url,
    pub browser_timeout: Duration,
}

/// Executors keyed by the instruction type they serve.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<InstructionType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five built-in executors.
    pub fn standard(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandExecutor::new(config.command_timeout)));
        registry.register(Arc::new(DnsExecutor));
        registry.register(Arc::new(HttpExecutor::new(config.http_timeout)?));
        registry.register(Arc::new(IcmpExecutor::new(config.ping_count)));
        registry.register(Arc::new(BrowserExecutor::new(
            config.browser_endpoint.clone(),
            config.browser_timeout,
        )?));
        Ok(registry)
    }

    /// Replaces any executor already registered for the same type.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: InstructionType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }
}
