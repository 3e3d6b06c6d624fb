//! Soldier side of the duplex session.
//!
//! [`Session::open`] dials the commander, retrying with a fixed delay until it
//! connects or is cancelled. A supervisor task then owns the websocket: per
//! connection it runs the read, write and keepalive loops side by side, and
//! when any of them hits a transport error it redials and carries on with the
//! same outbound buffer and inbound stream. Callers keep their [`Session`]
//! handle across reconnects.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use camp_core::AgentIdentity;
use futures_util::stream::{SplitSink, Stream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const TOKEN_HEADER: &str = "token";
const PONG_DEADLINE: Duration = Duration::from_secs(1);
const CLOSE_DEADLINE: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OUTBOUND_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session cancelled")]
    Cancelled,
    #[error("session closed")]
    Closed,
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: Url,
    pub identity: AgentIdentity,
    pub token: Option<String>,
    pub retry_delay: Duration,
    pub outbound_depth: usize,
}

impl SessionOptions {
    pub fn new(endpoint: Url, identity: AgentIdentity) -> Self {
        Self {
            endpoint,
            identity,
            token: None,
            retry_delay: Duration::from_secs(2),
            outbound_depth: DEFAULT_OUTBOUND_DEPTH,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Endpoint with the identity appended as query parameters.
    pub fn connect_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("orgUuid", &self.identity.org_id)
            .append_pair("groupUuid", &self.identity.group_id)
            .append_pair("instanceName", &self.identity.instance_name);
        url
    }

    fn request(&self) -> Result<Request, SessionError> {
        let mut request = self
            .connect_url()
            .as_str()
            .into_client_request()
            .map_err(|err| SessionError::InvalidRequest(err.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(token)
                .map_err(|err| SessionError::InvalidRequest(err.to_string()))?;
            request.headers_mut().insert(TOKEN_HEADER, value);
        }
        Ok(request)
    }
}

/// Cloneable handle for queueing outbound frames.
#[derive(Debug, Clone)]
pub struct SessionSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SessionSender {
    /// Wraps a bare channel, for driving an agent without a websocket.
    pub fn from_channel(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Waits only while the outbound buffer is full.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.tx.send(frame).await.map_err(|_| SessionError::Closed)
    }
}

/// Inbound frames, in arrival order. Ends when the session closes.
#[derive(Debug)]
pub struct Frames {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Stream for Frames {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub struct Session {
    sender: SessionSender,
    frames: Option<Frames>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl Session {
    /// Connects to the commander, retrying every `retry_delay` until it
    /// succeeds or `cancel` fires.
    pub async fn open(options: SessionOptions, cancel: CancellationToken) -> Result<Self, SessionError> {
        let ws = connect_with_retry(&options, &cancel).await?;
        let (out_tx, out_rx) = mpsc::channel(options.outbound_depth.max(1));
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(supervise(ws, options, out_rx, in_tx, cancel.clone(), done_tx));

        Ok(Self {
            sender: SessionSender { tx: out_tx },
            frames: Some(Frames { rx: in_rx }),
            cancel,
            done: done_rx,
        })
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.sender.send(frame).await
    }

    /// The inbound stream. Only the first call returns it.
    pub fn take_frames(&mut self) -> Option<Frames> {
        self.frames.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the supervisor has stopped every task.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Sends a normal closure, stops the session and waits for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.closed().await;
    }
}

async fn connect_with_retry(
    options: &SessionOptions,
    cancel: &CancellationToken,
) -> Result<WsStream, SessionError> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let request = options.request()?;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            outcome = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)) => outcome,
        };
        match outcome {
            Ok(Ok((ws, _response))) => {
                info!(endpoint = %options.endpoint, attempt, "connected to commander");
                return Ok(ws);
            }
            Ok(Err(err)) => {
                warn!(endpoint = %options.endpoint, attempt, error = %err, "connect failed");
            }
            Err(_) => {
                warn!(endpoint = %options.endpoint, attempt, "connect timed out");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = tokio::time::sleep(options.retry_delay) => {}
        }
    }
}

enum ConnectionEnd {
    Cancelled,
    /// Every sender handle was dropped.
    Finished,
    Broken(String),
}

async fn supervise(
    first: WsStream,
    options: SessionOptions,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let mut connection = Some(first);
    // A frame taken off the buffer but not yet written; it goes out first on
    // the next connection.
    let mut pending: Option<Vec<u8>> = None;
    loop {
        let ws = match connection.take() {
            Some(ws) => ws,
            None => match connect_with_retry(&options, &cancel).await {
                Ok(ws) => ws,
                Err(_) => break,
            },
        };
        match drive(ws, &mut outbound, &inbound, &mut pending, &cancel).await {
            ConnectionEnd::Cancelled => {
                info!("session cancelled");
                break;
            }
            ConnectionEnd::Finished => {
                debug!("all session senders dropped");
                break;
            }
            ConnectionEnd::Broken(reason) => {
                warn!(%reason, retry_in = ?options.retry_delay, "session connection lost; reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.retry_delay) => {}
                }
            }
        }
    }
    cancel.cancel();
    drop(inbound);
    let _ = done.send(true);
}

async fn drive(
    ws: WsStream,
    outbound: &mut mpsc::Receiver<Vec<u8>>,
    inbound: &mpsc::UnboundedSender<Vec<u8>>,
    pending: &mut Option<Vec<u8>>,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    let (sink, mut stream) = ws.split();
    let sink = Arc::new(Mutex::new(sink));
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let read = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let _ = inbound.send(text.into_bytes());
                }
                Ok(Message::Binary(bytes)) => {
                    let _ = inbound.send(bytes);
                }
                Ok(Message::Ping(payload)) => {
                    let _ = ping_tx.send(payload);
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    return format!(
                        "commander closed the connection ({})",
                        frame.map(|f| f.reason.to_string()).unwrap_or_default()
                    );
                }
                Err(err) => return format!("read failed: {err}"),
            }
        }
        "connection ended".to_string()
    };

    let keepalive = async {
        while let Some(payload) = ping_rx.recv().await {
            let reply = async { sink.lock().await.send(Message::Pong(payload)).await };
            match tokio::time::timeout(PONG_DEADLINE, reply).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return format!("pong failed: {err}"),
                Err(_) => return "pong not sent within deadline".to_string(),
            }
        }
        "keepalive stopped".to_string()
    };

    let write = async {
        loop {
            let frame = next_outbound(outbound, pending).await?;
            let sent = sink.lock().await.send(Message::Binary(frame)).await;
            match sent {
                // Only an acknowledged send releases the frame.
                Ok(()) => *pending = None,
                Err(err) => return Some(format!("write failed: {err}")),
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            close(&sink).await;
            ConnectionEnd::Cancelled
        }
        reason = read => ConnectionEnd::Broken(reason),
        reason = keepalive => ConnectionEnd::Broken(reason),
        outcome = write => match outcome {
            Some(reason) => ConnectionEnd::Broken(reason),
            None => {
                close(&sink).await;
                ConnectionEnd::Finished
            }
        },
    }
}

/// Next frame to write: the unacknowledged one if any, otherwise a fresh one
/// from the buffer, parked in `pending` before it is handed out so a dropped
/// write keeps it. `None` once every sender is gone.
async fn next_outbound(
    outbound: &mut mpsc::Receiver<Vec<u8>>,
    pending: &mut Option<Vec<u8>>,
) -> Option<Vec<u8>> {
    if pending.is_none() {
        *pending = Some(outbound.recv().await?);
    }
    pending.clone()
}

async fn close(sink: &Mutex<WsSink>) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    let closing = async {
        let mut sink = sink.lock().await;
        sink.send(Message::Close(Some(frame))).await?;
        sink.close().await
    };
    if let Err(err) = tokio::time::timeout(CLOSE_DEADLINE, closing)
        .await
        .unwrap_or(Ok(()))
    {
        debug!(error = %err, "close handshake failed");
    }
}
