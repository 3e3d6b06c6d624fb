use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::info;

use crate::config::{CommanderConfig, StoreBackend};
use crate::ledger::{InMemoryLedger, Ledger};
use crate::ledger_redis::RedisLedger;
use crate::queue::{InMemoryQueue, InstructionQueue};
use crate::queue_redis::RedisQueue;
use crate::registry::{InMemoryInstanceStore, InstanceStore};
use crate::registry_redis::RedisInstanceStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("record {0} not found")]
    NotFound(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// The three shared stores every session and handler works against.
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn InstanceStore>,
    pub ledger: Arc<dyn Ledger>,
    pub queue: Arc<dyn InstructionQueue>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            instances: Arc::new(InMemoryInstanceStore::default()),
            ledger: Arc::new(InMemoryLedger::default()),
            queue: Arc::new(tokio::sync::Mutex::new(InMemoryQueue::new())),
        }
    }

    pub async fn connect(config: &CommanderConfig) -> Result<Self> {
        match config.store {
            StoreBackend::Memory => {
                info!("using in-memory stores");
                Ok(Self::in_memory())
            }
            StoreBackend::Redis => {
                let url = config
                    .redis_url
                    .as_deref()
                    .context("--store redis requires --redis-url")?;
                let client = redis::Client::open(url).context("failed to create redis client")?;
                let manager = ConnectionManager::new(client)
                    .await
                    .context("failed to connect to redis")?;
                info!(redis_url = %url, "using redis stores");
                Ok(Self {
                    instances: Arc::new(RedisInstanceStore::new(manager.clone())),
                    ledger: Arc::new(RedisLedger::new(manager.clone())),
                    queue: Arc::new(RedisQueue::new(manager)),
                })
            }
        }
    }
}
