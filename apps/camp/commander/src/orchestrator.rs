//! Commander half of the instruction lifecycle.
//!
//! `issue` gates on liveness, writes a pending ledger row, then queues the
//! encoded directive. `handle_report` correlates replies by instruction uuid
//! and records the outcome.

use std::sync::Arc;

use camp_core::{
    encode_directive, AgentIdentity, Directive, Instance, InstructionRecord, InstructionReply,
    InstructionRequest, InstructionState, InstructionType, Payload, ReplyOutcome, Report,
    ReportKind,
};
use dashmap::DashMap;
use metrics::counter;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::ledger::{Ledger, LIST_LIMIT};
use crate::queue::InstructionQueue;
use crate::registry::InstanceRegistry;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("unknown instruction type {0}")]
    UnknownInstructionType(i32),
    #[error("instance {0} is not alive")]
    TargetNotAlive(AgentIdentity),
    #[error("failed to check liveness: {0}")]
    Registry(#[source] StoreError),
    #[error("failed to record instruction: {0}")]
    Ledger(#[source] StoreError),
    #[error("instruction {uuid} recorded but not queued: {source}")]
    Queue {
        uuid: String,
        #[source]
        source: StoreError,
    },
}

impl IssueError {
    fn reason(&self) -> &'static str {
        match self {
            IssueError::UnknownInstructionType(_) => "unknown_type",
            IssueError::TargetNotAlive(_) => "not_alive",
            IssueError::Registry(_) => "registry",
            IssueError::Ledger(_) => "ledger",
            IssueError::Queue { .. } => "queue",
        }
    }
}

/// What became of one inbound report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDisposition {
    Recorded(InstructionState),
    UnknownInstruction,
    TypeMismatch,
    UnknownType,
    LedgerError,
    Logged,
}

pub struct Commander {
    registry: InstanceRegistry,
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn InstructionQueue>,
    clock: SharedClock,
    signals: DashMap<AgentIdentity, Arc<Notify>>,
}

impl Commander {
    pub fn new(
        registry: InstanceRegistry,
        ledger: Arc<dyn Ledger>,
        queue: Arc<dyn InstructionQueue>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            ledger,
            queue,
            clock,
            signals: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub async fn issue(
        &self,
        target: &AgentIdentity,
        type_code: i32,
        content: impl Into<String>,
    ) -> Result<String, IssueError> {
        let result = self.try_issue(target, type_code, content.into()).await;
        match &result {
            Ok(uuid) => info!(instance = %target, %uuid, type_code, "instruction issued"),
            Err(err) => {
                counter!("camp_instructions_rejected_total", 1, "reason" => err.reason());
                warn!(instance = %target, type_code, error = %err, "instruction rejected");
            }
        }
        result
    }

    async fn try_issue(
        &self,
        target: &AgentIdentity,
        type_code: i32,
        content: String,
    ) -> Result<String, IssueError> {
        let kind = InstructionType::try_from(type_code)
            .map_err(|err| IssueError::UnknownInstructionType(err.0))?;
        if !self
            .registry
            .is_alive(target)
            .await
            .map_err(IssueError::Registry)?
        {
            return Err(IssueError::TargetNotAlive(target.clone()));
        }

        let request = InstructionRequest::new(kind, content);
        let uuid = request.uuid.clone();
        let record = InstructionRecord::pending(
            &uuid,
            target.clone(),
            kind,
            &request.content,
            self.clock.now(),
        );
        self.ledger
            .record(record)
            .await
            .map_err(IssueError::Ledger)?;

        let frame = encode_directive(&Directive::instruct(request));
        self.queue
            .push(target, frame)
            .await
            .map_err(|source| IssueError::Queue {
                uuid: uuid.clone(),
                source,
            })?;
        counter!("camp_instructions_issued_total", 1, "type" => kind.as_str());
        self.delivery_signal(target).notify_one();
        Ok(uuid)
    }

    /// Wakes the delivery loop for `target` when something is queued.
    pub fn delivery_signal(&self, target: &AgentIdentity) -> Arc<Notify> {
        self.signals
            .entry(target.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub async fn next_directive(&self, target: &AgentIdentity) -> Result<Option<Vec<u8>>, StoreError> {
        self.queue.pop(target).await
    }

    /// Puts back a directive whose write failed so the next session gets it first.
    pub async fn requeue(&self, target: &AgentIdentity, frame: Vec<u8>) -> Result<(), StoreError> {
        self.queue.requeue_front(target, frame).await
    }

    pub async fn handle_report(&self, from: &AgentIdentity, report: Report) -> ReportDisposition {
        match report.kind {
            ReportKind::HelloEcho => {
                debug!(instance = %from, text = %report.text, "hello echo");
                ReportDisposition::Logged
            }
            ReportKind::ScreenCapture(image) => {
                info!(instance = %from, bytes = image.len(), "screen capture received");
                ReportDisposition::Logged
            }
            ReportKind::Unknown(code) => {
                counter!("camp_frames_dropped_total", 1, "reason" => "unknown_report");
                warn!(instance = %from, code, "dropping report of unknown type");
                ReportDisposition::UnknownType
            }
            ReportKind::InstructReply(Payload::Unknown(unknown)) => {
                counter!("camp_frames_dropped_total", 1, "reason" => "unknown_instruction_type");
                warn!(
                    instance = %from,
                    uuid = %unknown.uuid,
                    code = unknown.code,
                    "dropping reply with unknown instruction type"
                );
                ReportDisposition::UnknownType
            }
            ReportKind::InstructReply(Payload::Known(reply)) => self.record_reply(from, reply).await,
        }
    }

    async fn record_reply(&self, from: &AgentIdentity, reply: InstructionReply) -> ReportDisposition {
        let existing = match self.ledger.get(&reply.uuid).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                counter!("camp_frames_dropped_total", 1, "reason" => "unknown_instruction");
                warn!(instance = %from, uuid = %reply.uuid, "reply for unknown instruction");
                return ReportDisposition::UnknownInstruction;
            }
            Err(err) => {
                counter!("camp_ledger_errors_total", 1, "op" => "get");
                error!(uuid = %reply.uuid, error = %err, "ledger lookup failed");
                return ReportDisposition::LedgerError;
            }
        };
        if existing.kind != reply.kind {
            counter!("camp_frames_dropped_total", 1, "reason" => "type_mismatch");
            warn!(
                uuid = %reply.uuid,
                expected = %existing.kind,
                received = %reply.kind,
                "reply type does not match instruction"
            );
            return ReportDisposition::TypeMismatch;
        }

        let (state, text) = match reply.outcome {
            ReplyOutcome::Success(payload) => (InstructionState::Completed, payload.ledger_text()),
            ReplyOutcome::Failure(err) => (InstructionState::Failed, err),
        };
        match self
            .ledger
            .complete(&reply.uuid, state, text, self.clock.now())
            .await
        {
            Ok(Some(_)) => {
                let result = if state == InstructionState::Completed {
                    "success"
                } else {
                    "failure"
                };
                counter!(
                    "camp_instruction_replies_total",
                    1,
                    "type" => reply.kind.as_str(),
                    "result" => result
                );
                info!(instance = %from, uuid = %reply.uuid, result, "instruction reply recorded");
                ReportDisposition::Recorded(state)
            }
            Ok(None) => {
                warn!(uuid = %reply.uuid, "instruction vanished before its reply was recorded");
                ReportDisposition::UnknownInstruction
            }
            Err(err) => {
                counter!("camp_ledger_errors_total", 1, "op" => "complete");
                error!(uuid = %reply.uuid, error = %err, "failed to record instruction reply");
                ReportDisposition::LedgerError
            }
        }
    }

    pub async fn list_alive(
        &self,
        org_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<Instance>, StoreError> {
        self.registry.list_alive(org_id, group_id).await
    }

    pub async fn list_instructions(
        &self,
        target: &AgentIdentity,
    ) -> Result<Vec<InstructionRecord>, StoreError> {
        self.ledger.list(target, LIST_LIMIT).await
    }

    /// Looks up one instruction, visible only under its own target.
    pub async fn get_instruction(
        &self,
        target: &AgentIdentity,
        uuid: &str,
    ) -> Result<Option<InstructionRecord>, StoreError> {
        Ok(self
            .ledger
            .get(uuid)
            .await?
            .filter(|record| &record.target == target))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use camp_core::{decode_directive, DirectiveKind, ReplyPayload};
    use time::OffsetDateTime;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::InMemoryLedger;
    use crate::queue::InMemoryQueue;
    use crate::registry::{InMemoryInstanceStore, RegistryConfig};

    struct Fixture {
        commander: Arc<Commander>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with_ledger(ledger: Arc<dyn Ledger>) -> Fixture {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH + Duration::from_secs(100)));
        let registry = InstanceRegistry::new(
            Arc::new(InMemoryInstanceStore::default()),
            clock.clone(),
            RegistryConfig::default(),
        );
        let queue: Arc<dyn InstructionQueue> = Arc::new(tokio::sync::Mutex::new(InMemoryQueue::new()));
        let commander = Arc::new(Commander::new(registry, ledger.clone(), queue, clock.clone()));
        Fixture {
            commander,
            ledger,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_ledger(Arc::new(InMemoryLedger::default()))
    }

    fn target() -> AgentIdentity {
        AgentIdentity::new("org", "grp", "node-1").unwrap()
    }

    async fn register(fixture: &Fixture, identity: &AgentIdentity) {
        fixture
            .commander
            .registry()
            .register(identity, "10.0.0.1", &CancellationToken::new())
            .await
            .unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn dns_round_trip_completes_the_record() {
        let fx = fixture();
        let target = target();
        register(&fx, &target).await;

        let uuid = fx
            .commander
            .issue(&target, InstructionType::Dns.code(), "example.com")
            .await
            .unwrap();
        let pending = fx.ledger.get(&uuid).await.unwrap().unwrap();
        assert_eq!(pending.result, InstructionState::Pending);

        let frame = fx.commander.next_directive(&target).await.unwrap().unwrap();
        let DirectiveKind::Instruct(Payload::Known(request)) = decode_directive(&frame).unwrap().kind
        else {
            panic!("expected an instruct directive");
        };
        assert_eq!(request.uuid, uuid);
        assert_eq!(request.content, "example.com");

        let reply = InstructionReply::success(
            uuid.clone(),
            ReplyPayload::Dns(vec!["93.184.216.34".into()]),
        );
        let disposition = fx.commander.handle_report(&target, Report::reply(reply)).await;
        assert_eq!(disposition, ReportDisposition::Recorded(InstructionState::Completed));

        let done = fx.ledger.get(&uuid).await.unwrap().unwrap();
        assert_eq!(done.result, InstructionState::Completed);
        assert_eq!(done.reply, "93.184.216.34");
    }

    #[test_timeout::tokio_timeout_test]
    async fn failure_reply_stores_error_text() {
        let fx = fixture();
        let target = target();
        register(&fx, &target).await;
        let uuid = fx
            .commander
            .issue(&target, InstructionType::Command.code(), "false")
            .await
            .unwrap();

        let reply = InstructionReply::failure(uuid.clone(), InstructionType::Command, "exit status: 1");
        fx.commander.handle_report(&target, Report::reply(reply)).await;

        let record = fx.ledger.get(&uuid).await.unwrap().unwrap();
        assert_eq!(record.result, InstructionState::Failed);
        assert_eq!(record.reply, "exit status: 1");
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_unknown_type_and_dead_targets_without_writing() {
        let fx = fixture();
        let target = target();

        let err = fx.commander.issue(&target, 3, "example.com").await.unwrap_err();
        assert!(matches!(err, IssueError::TargetNotAlive(_)));

        register(&fx, &target).await;
        let err = fx.commander.issue(&target, 12, "x").await.unwrap_err();
        assert!(matches!(err, IssueError::UnknownInstructionType(12)));

        fx.clock.advance(Duration::from_secs(21));
        let err = fx.commander.issue(&target, 1, "uptime").await.unwrap_err();
        assert!(matches!(err, IssueError::TargetNotAlive(_)));

        assert!(fx.commander.list_instructions(&target).await.unwrap().is_empty());
        assert!(fx.commander.next_directive(&target).await.unwrap().is_none());
    }

    struct BrokenLedger;

    #[async_trait]
    impl Ledger for BrokenLedger {
        async fn record(&self, _record: InstructionRecord) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn complete(
            &self,
            _uuid: &str,
            _state: InstructionState,
            _reply: String,
            _now: OffsetDateTime,
        ) -> Result<Option<InstructionRecord>, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn get(&self, _uuid: &str) -> Result<Option<InstructionRecord>, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn list(
            &self,
            _target: &AgentIdentity,
            _limit: usize,
        ) -> Result<Vec<InstructionRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn ledger_failure_queues_nothing() {
        let fx = fixture_with_ledger(Arc::new(BrokenLedger));
        let target = target();
        register(&fx, &target).await;

        let err = fx.commander.issue(&target, 1, "uptime").await.unwrap_err();
        assert!(matches!(err, IssueError::Ledger(_)));
        assert!(fx.commander.next_directive(&target).await.unwrap().is_none());

        let reply = InstructionReply::success("whatever", ReplyPayload::Command(String::new()));
        let disposition = fx.commander.handle_report(&target, Report::reply(reply)).await;
        assert_eq!(disposition, ReportDisposition::LedgerError);
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_issues_resolve_independently() {
        let fx = fixture();
        let target = target();
        register(&fx, &target).await;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let commander = fx.commander.clone();
            let target = target.clone();
            tasks.spawn(async move { commander.issue(&target, 1, format!("echo {i}")).await });
        }
        let mut uuids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            uuids.push(joined.unwrap().unwrap());
        }
        let unique: HashSet<&String> = uuids.iter().collect();
        assert_eq!(unique.len(), 16);

        // Reply in reverse order, alternating success and failure.
        for (i, uuid) in uuids.iter().rev().enumerate() {
            let reply = if i % 2 == 0 {
                InstructionReply::success(uuid.clone(), ReplyPayload::Command(format!("{i}")))
            } else {
                InstructionReply::failure(uuid.clone(), InstructionType::Command, "boom")
            };
            fx.commander.handle_report(&target, Report::reply(reply)).await;
        }
        for (i, uuid) in uuids.iter().rev().enumerate() {
            let record = fx.ledger.get(uuid).await.unwrap().unwrap();
            let expected = if i % 2 == 0 {
                InstructionState::Completed
            } else {
                InstructionState::Failed
            };
            assert_eq!(record.result, expected);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn unmatched_replies_are_dropped() {
        let fx = fixture();
        let target = target();
        register(&fx, &target).await;

        let stray = InstructionReply::success("missing", ReplyPayload::Command("x".into()));
        assert_eq!(
            fx.commander.handle_report(&target, Report::reply(stray)).await,
            ReportDisposition::UnknownInstruction
        );

        let uuid = fx.commander.issue(&target, 3, "example.com").await.unwrap();
        let wrong_kind = InstructionReply::success(uuid.clone(), ReplyPayload::Command("x".into()));
        assert_eq!(
            fx.commander.handle_report(&target, Report::reply(wrong_kind)).await,
            ReportDisposition::TypeMismatch
        );
        let record = fx.ledger.get(&uuid).await.unwrap().unwrap();
        assert_eq!(record.result, InstructionState::Pending);

        let unknown = Report {
            text: String::new(),
            kind: ReportKind::InstructReply(Payload::Unknown(camp_core::UnknownInstruction {
                uuid,
                code: 99,
            })),
        };
        assert_eq!(
            fx.commander.handle_report(&target, unknown).await,
            ReportDisposition::UnknownType
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn issue_wakes_the_delivery_signal() {
        let fx = fixture();
        let target = target();
        register(&fx, &target).await;
        let signal = fx.commander.delivery_signal(&target);
        fx.commander.issue(&target, 1, "true").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.notified())
            .await
            .expect("delivery signal not raised");
    }

    #[test_timeout::tokio_timeout_test]
    async fn get_instruction_is_scoped_to_its_target() {
        let fx = fixture();
        let target = target();
        register(&fx, &target).await;
        let uuid = fx.commander.issue(&target, 1, "true").await.unwrap();
        let other = AgentIdentity::new("org", "grp", "node-2").unwrap();
        assert!(fx.commander.get_instruction(&target, &uuid).await.unwrap().is_some());
        assert!(fx.commander.get_instruction(&other, &uuid).await.unwrap().is_none());
    }
}
