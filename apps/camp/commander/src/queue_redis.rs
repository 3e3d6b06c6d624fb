use async_trait::async_trait;
use camp_core::AgentIdentity;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::queue::InstructionQueue;
use crate::store::StoreError;

/// FIFO list per soldier: RPUSH to issue, LPOP to deliver, LPUSH to requeue.
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
}

impl RedisQueue {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

fn lane_key(target: &AgentIdentity) -> String {
    format!("camp:queue:{}", target.key())
}

#[async_trait]
impl InstructionQueue for RedisQueue {
    async fn push(&self, target: &AgentIdentity, frame: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.rpush(lane_key(target), frame).await?;
        Ok(())
    }

    async fn pop(&self, target: &AgentIdentity) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.manager.clone();
        let frame: Option<Vec<u8>> = conn.lpop(lane_key(target), None).await?;
        Ok(frame)
    }

    async fn requeue_front(
        &self,
        target: &AgentIdentity,
        frame: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(lane_key(target), frame).await?;
        Ok(())
    }
}
