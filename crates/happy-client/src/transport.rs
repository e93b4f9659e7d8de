//! The bidirectional event socket shared by C6 and C7 (§6).
//!
//! Realized as a single `tokio-tungstenite` WebSocket carrying small JSON
//! `{event, data}` frames, with acks correlated client-side by an `ackId`
//! and a oneshot channel — the nearest idiomatic stand-in for the source's
//! socket.io transport without pulling in a socket.io-compatible crate
//! this ecosystem doesn't have (see DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::RngExt;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

type WsSender = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReceiver = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long a [`EventSocket::send_ack`] call waits for the server's response.
const ACK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none", rename = "ackId")]
    ack_id: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Ack {
        #[serde(rename = "ackId")]
        ack_id: String,
        result: Value,
    },
    Event {
        event: String,
        data: Value,
        /// Present when the server expects a reply correlated by id (e.g.
        /// `rpc-request`) rather than firing and forgetting.
        #[serde(default, rename = "ackId")]
        ack_id: Option<String>,
    },
}

#[derive(Serialize)]
struct AckReplyFrame<'a> {
    #[serde(rename = "ackId")]
    ack_id: &'a str,
    result: Value,
}

/// Reconnection is unconditional and unbounded (§4.6: "leave reconnect to
/// the socket library, infinite attempts, 1-5 s delay") — deliberately
/// looser than C9's bounded [`crate::backoff::BackoffPolicy`], which governs
/// application-level retries, not the transport itself.
fn socket_reconnect_delay() -> Duration {
    Duration::from_millis(rand::rng().random_range(1_000..=5_000))
}

/// Minimal percent-encoding for query values (ids, tokens, uuids). Not a
/// general-purpose encoder: only what [`EventSocket`]'s own query params need.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// A single named event socket connection (session-scoped, user-scoped, or
/// machine-scoped). Owns exactly one underlying WebSocket at a time.
pub struct EventSocket {
    url: String,
    token: String,
    query: Vec<(String, String)>,
    sender: Mutex<Option<WsSender>>,
    receiver: Mutex<Option<WsReceiver>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    connected: AtomicBool,
    next_ack_id: AtomicU64,
}

impl EventSocket {
    pub fn new(url: impl Into<String>, token: impl Into<String>, query: Vec<(String, String)>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            token: token.into(),
            query,
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            next_ack_id: AtomicU64::new(0),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn dial_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let pairs: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}{}", self.url, pairs.join("&"))
    }

    async fn dial(&self) -> Result<()> {
        let mut request = self
            .dial_url()
            .into_client_request()
            .map_err(|e| ClientError::Offline(format!("failed to build request: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ClientError::Offline(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (stream, _response) = connect_async(request).await?;
        let (sender, receiver) = stream.split();
        *self.sender.lock().await = Some(sender);
        *self.receiver.lock().await = Some(receiver);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Best-effort, volatile send: dropped silently if not connected.
    pub async fn emit(&self, event: &str, data: Value) {
        if !self.is_connected() {
            debug!(event, "dropping emit while disconnected");
            return;
        }
        let frame = OutboundFrame {
            event,
            data,
            ack_id: None,
        };
        self.write_frame(&frame).await;
    }

    /// Send a frame and await its ack, or `Err` if the socket is
    /// disconnected or the server never answers within [`ACK_TIMEOUT`].
    pub async fn send_ack(&self, event: &str, data: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(ClientError::Offline(format!(
                "cannot send {event}: socket disconnected"
            )));
        }
        let ack_id = self
            .next_ack_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(ack_id.clone(), tx);

        let frame = OutboundFrame {
            event,
            data,
            ack_id: Some(ack_id.clone()),
        };
        self.write_frame(&frame).await;

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ClientError::Offline(format!("{event}: socket closed before ack"))),
            Err(_) => {
                self.pending_acks.lock().await.remove(&ack_id);
                Err(ClientError::Offline(format!("{event}: ack timed out")))
            }
        }
    }

    async fn write_frame(&self, frame: &OutboundFrame<'_>) {
        let Ok(json) = serde_json::to_string(frame) else {
            warn!(event = frame.event, "failed to serialize outbound frame");
            return;
        };
        self.write_text(&json, frame.event).await;
    }

    /// Reply to a server-initiated `{event, data, ackId}` frame. Unlike
    /// [`Self::send_ack`], this client is the *answerer*, not the asker: the
    /// `ackId` is the server's, just echoed back alongside the result.
    pub async fn reply_ack(&self, ack_id: &str, result: Value) {
        let frame = AckReplyFrame { ack_id, result };
        let Ok(json) = serde_json::to_string(&frame) else {
            warn!(ack_id, "failed to serialize ack reply");
            return;
        };
        self.write_text(&json, "ack-reply").await;
    }

    async fn write_text(&self, json: &str, label: &str) {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_mut() {
            if let Err(e) = sender.send(Message::Text(json.to_string())).await {
                debug!(error = %e, label, "send failed, marking disconnected");
                drop(guard);
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Drive the read loop until the socket is told to stop. Reconnects
    /// forever with a uniform 1-5s delay between attempts (§4.6). `on_event`
    /// is called for every pushed (non-ack) frame; `on_connect` fires after
    /// each successful dial, including reconnects.
    pub async fn run(
        self: Arc<Self>,
        stop: tokio::sync::watch::Receiver<bool>,
        on_connect: impl Fn() + Send + Sync + 'static,
        on_disconnect: impl Fn() + Send + Sync + 'static,
        on_event: impl Fn(String, Value, Option<String>) + Send + Sync + 'static,
    ) {
        let mut stop = stop;
        loop {
            if *stop.borrow() {
                return;
            }
            match self.dial().await {
                Ok(()) => {
                    info!(url = %self.url, "event socket connected");
                    on_connect();
                }
                Err(e) => {
                    debug!(error = %e, "event socket connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(socket_reconnect_delay()) => continue,
                        _ = stop.changed() => { if *stop.borrow() { return; } }
                    }
                    continue;
                }
            }

            self.read_until_disconnected(&on_event).await;
            self.connected.store(false, Ordering::SeqCst);
            on_disconnect();
            self.fail_pending_acks().await;

            if *stop.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(socket_reconnect_delay()) => {}
                _ = stop.changed() => { if *stop.borrow() { return; } }
            }
        }
    }

    async fn read_until_disconnected(
        &self,
        on_event: &(impl Fn(String, Value, Option<String>) + Send + Sync),
    ) {
        loop {
            let next = {
                let mut guard = self.receiver.lock().await;
                match guard.as_mut() {
                    Some(receiver) => receiver.next().await,
                    None => return,
                }
            };
            match next {
                Some(Ok(Message::Text(text))) => self.handle_text(&text, on_event).await,
                Some(Ok(Message::Ping(payload))) => {
                    let mut guard = self.sender.lock().await;
                    if let Some(sender) = guard.as_mut() {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("event socket closed");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "event socket read error");
                    return;
                }
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        on_event: &(impl Fn(String, Value, Option<String>) + Send + Sync),
    ) {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(InboundFrame::Ack { ack_id, result }) => {
                if let Some(tx) = self.pending_acks.lock().await.remove(&ack_id) {
                    let _ = tx.send(result);
                }
            }
            Ok(InboundFrame::Event { event, data, ack_id }) => on_event(event, data, ack_id),
            Err(e) => warn!(error = %e, "dropping unparseable frame"),
        }
    }

    async fn fail_pending_acks(&self) {
        self.pending_acks.lock().await.clear();
    }

    /// Tear down the underlying connection. Safe to call repeatedly.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_mut() {
            let _ = sender.send(Message::Close(None)).await;
        }
        *guard = None;
        *self.receiver.lock().await = None;
        self.fail_pending_acks().await;
    }
}
