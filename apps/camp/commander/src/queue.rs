//! Per-soldier hand-off between issuance and delivery.
//!
//! Entries are encoded directives. The queue is FIFO: `push` appends at the
//! tail, `pop` takes from the head, and `requeue_front` puts back a directive
//! that could not be written so it is the next one out.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use camp_core::AgentIdentity;

use crate::store::StoreError;

#[async_trait]
pub trait InstructionQueue: Send + Sync {
    async fn push(&self, target: &AgentIdentity, frame: Vec<u8>) -> Result<(), StoreError>;
    async fn pop(&self, target: &AgentIdentity) -> Result<Option<Vec<u8>>, StoreError>;
    async fn requeue_front(&self, target: &AgentIdentity, frame: Vec<u8>)
        -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryQueue {
    lanes: HashMap<AgentIdentity, VecDeque<Vec<u8>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstructionQueue for tokio::sync::Mutex<InMemoryQueue> {
    async fn push(&self, target: &AgentIdentity, frame: Vec<u8>) -> Result<(), StoreError> {
        self.lock()
            .await
            .lanes
            .entry(target.clone())
            .or_default()
            .push_back(frame);
        Ok(())
    }

    async fn pop(&self, target: &AgentIdentity) -> Result<Option<Vec<u8>>, StoreError> {
        let mut guard = self.lock().await;
        let Some(lane) = guard.lanes.get_mut(target) else {
            return Ok(None);
        };
        let frame = lane.pop_front();
        if lane.is_empty() {
            guard.lanes.remove(target);
        }
        Ok(frame)
    }

    async fn requeue_front(
        &self,
        target: &AgentIdentity,
        frame: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.lock()
            .await
            .lanes
            .entry(target.clone())
            .or_default()
            .push_front(frame);
        Ok(())
    }
}
