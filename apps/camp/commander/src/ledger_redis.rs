use async_trait::async_trait;
use camp_core::{AgentIdentity, InstructionRecord, InstructionState};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use time::OffsetDateTime;

use crate::ledger::Ledger;
use crate::store::StoreError;

/// One JSON document per instruction plus a per-target sorted set scored by
/// creation time.
#[derive(Clone)]
pub struct RedisLedger {
    manager: ConnectionManager,
}

impl RedisLedger {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

fn record_key(uuid: &str) -> String {
    format!("camp:instruction:{uuid}")
}

fn index_key(target: &AgentIdentity) -> String {
    format!("camp:instructions:{}", target.key())
}

fn score(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn record(&self, record: InstructionRecord) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(&record)?;
        let _: () = redis::pipe()
            .atomic()
            .set(record_key(&record.uuid), json)
            .ignore()
            .zadd(
                index_key(&record.target),
                &record.uuid,
                score(record.create_time),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        uuid: &str,
        state: InstructionState,
        reply: String,
        now: OffsetDateTime,
    ) -> Result<Option<InstructionRecord>, StoreError> {
        let Some(mut record) = self.get(uuid).await? else {
            return Ok(None);
        };
        record.result = state;
        record.reply = reply;
        record.update_time = now;
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(&record)?;
        let _: () = conn.set(record_key(uuid), json).await?;
        Ok(Some(record))
    }

    async fn get(&self, uuid: &str) -> Result<Option<InstructionRecord>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(record_key(uuid)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn list(
        &self,
        target: &AgentIdentity,
        limit: usize,
    ) -> Result<Vec<InstructionRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let uuids: Vec<String> = conn
            .zrevrange(index_key(target), 0, limit as isize - 1)
            .await?;
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = uuids.iter().map(|uuid| record_key(uuid)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}
