//! Commander side of one soldier session.
//!
//! Each upgraded websocket runs four tasks in a single `JoinSet`: the read
//! loop, the write loop (which also pings), the registry heartbeat and the
//! queue poller. They share one cancellation token and the outbound channel;
//! the session is over once all four have been joined.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use camp_core::{decode_report, AgentIdentity};
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::orchestrator::Commander;

const OUTBOUND_DEPTH: usize = 64;
const CLOSE_NORMAL: u16 = 1000;

/// At most one live session per soldier identity.
#[derive(Default)]
pub struct SessionDirectory {
    slots: DashMap<AgentIdentity, SessionSlot>,
    tasks: TaskTracker,
}

struct SessionSlot {
    id: Uuid,
    cancel: CancellationToken,
}

impl SessionDirectory {
    /// Claims the identity for a new session, cancelling whichever session
    /// held it before.
    pub fn claim(&self, identity: &AgentIdentity, cancel: CancellationToken) -> Uuid {
        let id = Uuid::new_v4();
        if let Some(previous) = self
            .slots
            .insert(identity.clone(), SessionSlot { id, cancel })
        {
            info!(instance = %identity, previous = %previous.id, "superseding older session");
            previous.cancel.cancel();
        }
        id
    }

    pub fn release(&self, identity: &AgentIdentity, id: Uuid) {
        self.slots.remove_if(identity, |_, slot| slot.id == id);
    }

    pub fn is_connected(&self, identity: &AgentIdentity) -> bool {
        self.slots.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Cancels every session, used at shutdown.
    pub fn cancel_all(&self) {
        for slot in self.slots.iter() {
            slot.cancel.cancel();
        }
    }

    /// Wraps a session future so [`SessionDirectory::drain`] waits for it.
    pub fn track<F>(&self, session: F) -> tokio_util::task::task_tracker::TrackedFuture<F>
    where
        F: std::future::Future,
    {
        self.tasks.track_future(session)
    }

    /// Cancels every session and resolves once all tracked sessions have
    /// finished their teardown.
    pub async fn drain(&self) {
        self.tasks.close();
        self.cancel_all();
        self.tasks.wait().await;
    }
}

/// A directive pulled from the queue and waiting for the writer.
struct Outbound {
    frame: Vec<u8>,
}

pub async fn run_agent_session(
    socket: WebSocket,
    identity: AgentIdentity,
    client_ip: String,
    commander: Arc<Commander>,
    directory: Arc<SessionDirectory>,
    config: SessionConfig,
) {
    let cancel = CancellationToken::new();
    let session_id = directory.claim(&identity, cancel.clone());
    counter!("camp_sessions_opened_total", 1);
    increment_gauge!("camp_sessions_active", 1.0);
    info!(instance = %identity, session = %session_id, client_ip = %client_ip, "session opened");

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_DEPTH);

    let mut tasks = JoinSet::new();
    tasks.spawn(read_loop(
        stream,
        identity.clone(),
        commander.clone(),
        config.read_idle,
        cancel.clone(),
    ));
    tasks.spawn(write_loop(
        sink,
        rx,
        identity.clone(),
        commander.clone(),
        config.clone(),
        cancel.clone(),
    ));
    tasks.spawn({
        let registry = commander.registry().clone();
        let identity = identity.clone();
        let cancel = cancel.clone();
        async move { registry.run_heartbeat(identity, client_ip, cancel).await }
    });
    tasks.spawn(poll_loop(
        tx,
        identity.clone(),
        commander.clone(),
        config,
        cancel.clone(),
    ));

    while let Some(joined) = tasks.join_next().await {
        // Any task ending takes the rest of the session with it.
        cancel.cancel();
        if let Err(err) = joined {
            warn!(instance = %identity, session = %session_id, error = %err, "session task failed");
        }
    }

    directory.release(&identity, session_id);
    decrement_gauge!("camp_sessions_active", 1.0);
    info!(instance = %identity, session = %session_id, "session closed");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    identity: AgentIdentity,
    commander: Arc<Commander>,
    read_idle: Duration,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = tokio::time::timeout(read_idle, stream.next()) => message,
        };
        let Ok(message) = message else {
            counter!("camp_sessions_idle_closed_total", 1);
            warn!(instance = %identity, idle = ?read_idle, "no frames from soldier; closing session");
            break;
        };
        let bytes = match message {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                info!(
                    instance = %identity,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "soldier closed websocket"
                );
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Err(err)) => {
                warn!(instance = %identity, error = %err, "websocket read failed");
                break;
            }
            None => break,
        };
        match decode_report(&bytes) {
            Ok(report) => {
                commander.handle_report(&identity, report).await;
            }
            Err(err) => {
                counter!("camp_frames_dropped_total", 1, "reason" => "malformed");
                warn!(instance = %identity, error = %err, "dropping malformed frame");
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    identity: AgentIdentity,
    commander: Arc<Commander>,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    let mut unsent = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_NORMAL,
                        reason: "session closed".into(),
                    })))
                    .await;
                break;
            }
            _ = ping.tick() => {
                if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                    warn!(instance = %identity, error = %err, "websocket ping failed");
                    break;
                }
            }
            outbound = rx.recv() => {
                let Some(outbound) = outbound else { break };
                let message = match String::from_utf8(outbound.frame) {
                    Ok(text) => Message::Text(text),
                    Err(err) => Message::Binary(err.into_bytes()),
                };
                if let Err(err) = sink.send(message.clone()).await {
                    warn!(instance = %identity, error = %err, "websocket write failed");
                    unsent.push(message.into_data());
                    break;
                }
                debug!(instance = %identity, "directive delivered");
            }
        }
    }

    cancel.cancel();
    rx.close();
    while let Some(outbound) = rx.recv().await {
        unsent.push(outbound.frame);
    }
    requeue_unsent(&commander, &identity, unsent).await;
}

/// Returns undelivered directives to the head of the queue, oldest first.
async fn requeue_unsent(commander: &Commander, identity: &AgentIdentity, unsent: Vec<Vec<u8>>) {
    if unsent.is_empty() {
        return;
    }
    info!(instance = %identity, count = unsent.len(), "requeueing undelivered directives");
    for frame in unsent.into_iter().rev() {
        if let Err(err) = commander.requeue(identity, frame).await {
            warn!(instance = %identity, error = %err, "failed to requeue directive");
        }
    }
}

async fn poll_loop(
    tx: mpsc::Sender<Outbound>,
    identity: AgentIdentity,
    commander: Arc<Commander>,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let signal = commander.delivery_signal(&identity);
    let mut ticker = tokio::time::interval(config.queue_poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = signal.notified() => {}
        }
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let frame = match commander.next_directive(&identity).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(instance = %identity, error = %err, "queue poll failed");
                    break;
                }
            };
            if let Err(mpsc::error::SendError(outbound)) = tx.send(Outbound { frame }).await {
                requeue_unsent(&commander, &identity, vec![outbound.frame]).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn newer_claim_cancels_older_session() {
        let directory = SessionDirectory::default();
        let identity = AgentIdentity::new("o", "g", "i").unwrap();

        let first_cancel = CancellationToken::new();
        let first = directory.claim(&identity, first_cancel.clone());
        let second_cancel = CancellationToken::new();
        let second = directory.claim(&identity, second_cancel.clone());

        assert!(first_cancel.is_cancelled());
        assert!(!second_cancel.is_cancelled());
        assert_eq!(directory.len(), 1);

        // The superseded session's release must not evict the new one.
        directory.release(&identity, first);
        assert!(directory.is_connected(&identity));
        directory.release(&identity, second);
        assert!(directory.is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn drain_waits_for_tracked_sessions() {
        let directory = Arc::new(SessionDirectory::default());
        let identity = AgentIdentity::new("o", "g", "i").unwrap();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let session = {
            let directory = directory.clone();
            let identity = identity.clone();
            let finished = finished.clone();
            async move {
                let cancel = CancellationToken::new();
                let id = directory.claim(&identity, cancel.clone());
                cancel.cancelled().await;
                // Teardown that outlives the cancellation itself.
                tokio::time::sleep(Duration::from_millis(100)).await;
                directory.release(&identity, id);
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        };
        tokio::spawn(directory.track(session));
        while !directory.is_connected(&identity) {
            tokio::task::yield_now().await;
        }

        directory.drain().await;
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        assert!(directory.is_empty());
    }
}
