//! Soldier half of the instruction lifecycle: decode directives, run the
//! matching executor and report back.

use std::sync::Arc;
use std::time::Duration;

use camp_core::{
    decode_directive, encode_report, DirectiveKind, InstructionReply, InstructionRequest, Payload,
    Report,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, ExecutorRegistry};
use crate::session::SessionSender;

#[derive(Clone)]
pub struct Agent {
    executors: Arc<ExecutorRegistry>,
    permits: Arc<Semaphore>,
    hello_interval: Duration,
}

impl Agent {
    pub fn new(executors: ExecutorRegistry, max_concurrent: usize, hello_interval: Duration) -> Self {
        Self {
            executors: Arc::new(executors),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            hello_interval,
        }
    }

    /// Runs until `frames` ends or `cancel` fires. In-flight instructions are
    /// aborted on cancellation and awaited otherwise.
    pub async fn run<S>(&self, frames: S, sender: SessionSender, cancel: CancellationToken)
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let mut frames = frames;
        let mut running = JoinSet::new();
        let mut hello = tokio::time::interval(self.hello_interval);
        hello.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    running.abort_all();
                    break;
                }
                _ = hello.tick() => {
                    let frame = encode_report(&Report::hello("hello"));
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                frame = frames.next() => {
                    let Some(frame) = frame else { break };
                    if let Some(request) = self.accept(&frame) {
                        let agent = self.clone();
                        let sender = sender.clone();
                        running.spawn(async move { agent.serve(request, sender).await });
                    }
                }
                Some(joined) = running.join_next() => {
                    if let Err(err) = joined {
                        if !err.is_cancelled() {
                            warn!(error = %err, "instruction task failed");
                        }
                    }
                }
            }
        }

        while running.join_next().await.is_some() {}
    }

    /// Decodes one inbound frame, returning the instruction to run if any.
    fn accept(&self, frame: &[u8]) -> Option<InstructionRequest> {
        let directive = match decode_directive(frame) {
            Ok(directive) => directive,
            Err(err) => {
                warn!(error = %err, "dropping malformed directive");
                return None;
            }
        };
        match directive.kind {
            DirectiveKind::HelloEcho => {
                debug!(text = %directive.text, "hello echo from commander");
                None
            }
            DirectiveKind::Instruct(Payload::Known(request)) => Some(request),
            DirectiveKind::Instruct(Payload::Unknown(unknown)) => {
                warn!(uuid = %unknown.uuid, code = unknown.code, "dropping instruction of unknown type");
                None
            }
            DirectiveKind::Unknown(code) => {
                warn!(code, "dropping directive of unknown type");
                None
            }
        }
    }

    async fn serve(&self, request: InstructionRequest, sender: SessionSender) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        let uuid = request.uuid.clone();
        info!(%uuid, kind = %request.kind, "executing instruction");
        let reply = self.execute(request).await;
        if reply.is_success() {
            info!(%uuid, "instruction succeeded");
        } else {
            warn!(%uuid, "instruction failed");
        }
        if sender.send(encode_report(&Report::reply(reply))).await.is_err() {
            warn!(%uuid, "session closed before the reply could be sent");
        }
    }

    /// Runs the executor for `request` and turns its outcome into a reply.
    /// Executor errors and panics both become failure replies.
    pub async fn execute(&self, request: InstructionRequest) -> InstructionReply {
        let InstructionRequest { uuid, kind, content } = request;
        let Some(executor) = self.executors.get(kind) else {
            return InstructionReply::failure(uuid, kind, ExecutorError::Unsupported(kind).to_string());
        };
        let handle = tokio::spawn(async move { executor.execute(&content).await });
        match handle.await {
            Ok(Ok(payload)) if payload.kind() == kind => InstructionReply::success(uuid, payload),
            Ok(Ok(payload)) => InstructionReply::failure(
                uuid,
                kind,
                format!("executor returned a {} reply", payload.kind()),
            ),
            Ok(Err(err)) => InstructionReply::failure(uuid, kind, err.to_string()),
            Err(err) => InstructionReply::failure(uuid, kind, format!("executor aborted: {err}")),
        }
    }
}
