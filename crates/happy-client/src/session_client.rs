//! Session sync client (C6, §4.6): the per-session object that owns the
//! session-scoped and user-scoped sockets, decrypts inbound updates,
//! serializes local writes through C5, and drives the pending-message
//! queue with at-most-once delivery.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::classifier::ConnectionTracker;
use crate::credentials::Credentials;
use crate::envelope;
use crate::error::Result;
use crate::http::HttpClient;
use crate::lock::AsyncLock;
use crate::queue::{self, DiscardReason, DiscardedItem, InFlightItem};
use crate::rpc::{RpcHandler, RpcRegistry};
use crate::transport::EventSocket;
use crate::types::{AgentState, Metadata, Session, Update, UpdateBody, WireContent};
use crate::updater::{self, AckOutcome};

/// Recovery timer delay after materializing a pending message (§4.6 step 7).
const RECOVERY_TIMER_DELAY: Duration = Duration::from_millis(500);
/// Transcript-recovery polling budget.
const RECOVERY_POLL_BUDGET: Duration = Duration::from_millis(7_500);
/// Idle grace before the user-scoped socket is closed after draining.
const USER_SOCKET_IDLE_GRACE: Duration = Duration::from_secs(2);

/// Plaintext shape wrapped before encryption for every outbound chat turn.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageBody {
    pub role: String,
    pub content: Value,
    #[serde(default)]
    pub meta: Value,
}

/// What a caller sees out of the decode pipeline.
#[derive(Debug, Clone)]
pub enum IncomingEvent {
    UserMessage {
        local_id: Option<String>,
        body: MessageBody,
    },
    GenericMessage {
        local_id: Option<String>,
        raw: Value,
    },
    MetadataUpdated,
}

struct Inner {
    session: TokioMutex<Session>,
    session_socket: Arc<EventSocket>,
    user_socket: Arc<EventSocket>,
    rpc: RpcRegistry,
    http: Arc<HttpClient>,
    credentials: Credentials,
    tracker: Arc<ConnectionTracker>,
    backoff: BackoffPolicy,
    metadata_lock: AsyncLock,
    agent_state_lock: AsyncLock,
    sync_lock: AsyncLock,
    pending_materialized: StdMutex<HashSet<String>>,
    events: broadcast::Sender<IncomingEvent>,
    metadata_epoch: watch::Sender<u64>,
    closed: AtomicBool,
    user_socket_wanted: AtomicU64,
    // Held for the lifetime of the client: a watch::Sender dropped early
    // makes every future `changed()` on its receiver resolve immediately,
    // which would turn the reconnect backoff in `EventSocket::run` into a
    // busy loop. `close()` sends `true` to ask the loop to stop cleanly.
    session_stop: watch::Sender<bool>,
    user_stop: watch::Sender<bool>,
}

/// Handle to a live session-sync client. Cheap to clone; all clones share
/// the same underlying session state and sockets.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

impl SessionClient {
    /// Build a client for `session`, wiring both sockets against `base_url`.
    /// Does not connect; call [`Self::connect`] to start the socket loops.
    pub fn new(
        session: Session,
        base_url: &str,
        token: &str,
        http: Arc<HttpClient>,
        credentials: Credentials,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        let session_id = session.id.clone();
        let socket_url = format!("{base_url}/v1/updates");
        let session_socket = EventSocket::new(
            socket_url.clone(),
            token,
            vec![
                ("clientType".into(), "session-scoped".into()),
                ("sessionId".into(), session_id.clone()),
            ],
        );
        let user_socket = EventSocket::new(
            socket_url,
            token,
            vec![("clientType".into(), "user-scoped".into())],
        );
        let (events, _rx) = broadcast::channel(256);
        let (metadata_epoch, _rx) = watch::channel(0);
        let (session_stop, _rx) = watch::channel(false);
        let (user_stop, _rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                session: TokioMutex::new(session),
                session_socket,
                user_socket,
                rpc: RpcRegistry::new(session_id),
                http,
                credentials,
                tracker,
                backoff: BackoffPolicy::default(),
                metadata_lock: AsyncLock::new(),
                agent_state_lock: AsyncLock::new(),
                sync_lock: AsyncLock::new(),
                pending_materialized: StdMutex::new(HashSet::new()),
                events,
                metadata_epoch,
                closed: AtomicBool::new(false),
                user_socket_wanted: AtomicU64::new(0),
                session_stop,
                user_stop,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IncomingEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_rpc(&self, method: impl Into<String>, handler: RpcHandler) {
        self.inner.rpc.register(method, handler);
    }

    /// Start the session-scoped socket's read loop. The user-scoped socket
    /// connects on demand (see [`Self::pop_pending_message`]).
    pub fn connect(&self) {
        let inner = self.inner.clone();
        let stop_rx = inner.session_stop.subscribe();
        tokio::spawn(async move {
            let on_connect = {
                let inner = inner.clone();
                move || {
                    let inner = inner.clone();
                    tokio::spawn(async move { Self::on_session_connect(inner).await });
                }
            };
            let on_disconnect = || {};
            let on_event = {
                let inner = inner.clone();
                move |event: String, data: Value, ack_id: Option<String>| {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        Self::on_session_event(inner, event, data, ack_id).await
                    });
                }
            };
            inner
                .session_socket
                .clone()
                .run(stop_rx, on_connect, on_disconnect, on_event)
                .await;
        });
    }

    async fn on_session_connect(inner: Arc<Inner>) {
        info!("session socket connected, re-registering rpc handlers");
        for method in inner.rpc.qualified_names() {
            inner
                .session_socket
                .emit("register-rpc-handler", serde_json::json!({ "method": method }))
                .await;
        }
        let needs_sync = {
            let session = inner.session.lock().await;
            session.metadata_version < 0 || session.agent_state_version < 0
        };
        if needs_sync {
            Self::snapshot_sync(&inner).await;
        }
    }

    async fn on_session_event(inner: Arc<Inner>, event: String, data: Value, ack_id: Option<String>) {
        match event.as_str() {
            "update" => Self::handle_update(&inner, data, Scope::Session).await,
            "rpc-request" => Self::handle_rpc_request(&inner, data, ack_id).await,
            other => debug!(event = other, "unhandled session-socket event"),
        }
    }

    /// §4.3: a `method_not_found`/`decrypt_failed` rejection is unencrypted;
    /// a handler's own success or `Err` is always encrypted, since only the
    /// caller should be able to read it.
    async fn handle_rpc_request(inner: &Arc<Inner>, data: Value, ack_id: Option<String>) {
        let Some(ack_id) = ack_id else {
            debug!("rpc-request frame missing ackId, dropping");
            return;
        };
        let Some(method) = data.get("method").and_then(Value::as_str) else {
            return;
        };
        let params = data.get("params").and_then(Value::as_str).unwrap_or("");
        let (variant, key) = {
            let session = inner.session.lock().await;
            (session.encryption.variant, session.encryption.key)
        };
        let outcome = inner.rpc.dispatch(variant, &key, method, params).await;
        let ack = match outcome {
            crate::rpc::DispatchOutcome::Encrypted(sealed) => {
                serde_json::json!({ "result": sealed })
            }
            crate::rpc::DispatchOutcome::ProtocolError { code, message } => {
                serde_json::json!({ "error": { "code": code, "message": message } })
            }
        };
        inner.session_socket.reply_ack(&ack_id, ack).await;
    }

    async fn handle_update(inner: &Arc<Inner>, data: Value, scope: Scope) {
        let update: Update = match serde_json::from_value(data) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "dropping malformed update frame");
                return;
            }
        };
        match update.body {
            UpdateBody::NewMessage { session_id, message } => {
                let our_id = inner.session.lock().await.id.clone();
                if session_id.as_deref() != Some(our_id.as_str()) {
                    return;
                }
                if scope == Scope::UserObserver {
                    let local_id = message.local_id.clone();
                    let mut confirmed = false;
                    if let Some(id) = &local_id {
                        let mut pending = inner.pending_materialized.lock().unwrap();
                        confirmed = pending.remove(id);
                    }
                    if !confirmed {
                        return;
                    }
                }
                Self::decode_and_dispatch_message(inner, message.local_id, message.content).await;
            }
            UpdateBody::UpdateSession { metadata, agent_state, .. } => {
                Self::adopt_session_update(inner, metadata, agent_state).await;
            }
            UpdateBody::UpdateMachine { .. } => {
                debug!("ignoring update-machine on session socket");
            }
        }
    }

    async fn decode_and_dispatch_message(
        inner: &Arc<Inner>,
        local_id: Option<String>,
        content: WireContent,
    ) {
        let WireContent::Encrypted { c } = content;
        let (variant, key) = {
            let session = inner.session.lock().await;
            (session.encryption.variant, session.encryption.key)
        };
        let Some(decoded) = envelope::open::<Value>(variant, &key, &c) else {
            debug!("dropping undecryptable message frame");
            return;
        };

        if let Some(id) = &local_id {
            let id = id.clone();
            let inner = inner.clone();
            tokio::spawn(async move { Self::clear_in_flight_best_effort(&inner, &id).await });
        }

        let event = match serde_json::from_value::<MessageBody>(decoded.clone()) {
            Ok(body) => IncomingEvent::UserMessage { local_id, body },
            Err(_) => IncomingEvent::GenericMessage {
                local_id,
                raw: decoded,
            },
        };
        let _ = inner.events.send(event);
    }

    async fn adopt_session_update(
        inner: &Arc<Inner>,
        metadata: Option<crate::types::VersionedBlob>,
        agent_state: Option<crate::types::VersionedBlob>,
    ) {
        let mut session = inner.session.lock().await;
        let variant = session.encryption.variant;
        let key = session.encryption.key;
        let mut adopted = false;

        if let Some(blob) = metadata {
            if blob.version > session.metadata_version {
                if let Some(decoded) = envelope::open::<Metadata>(variant, &key, &blob.ciphertext) {
                    session.metadata = decoded;
                    session.metadata_version = blob.version;
                    adopted = true;
                }
            }
        }
        if let Some(blob) = agent_state {
            if blob.version > session.agent_state_version {
                if let Some(decoded) = envelope::open::<AgentState>(variant, &key, &blob.ciphertext)
                {
                    session.agent_state = Some(decoded);
                    session.agent_state_version = blob.version;
                    adopted = true;
                }
            }
        }
        drop(session);

        if adopted {
            inner.metadata_epoch.send_modify(|epoch| *epoch += 1);
            let _ = inner.events.send(IncomingEvent::MetadataUpdated);
        }
    }

    async fn clear_in_flight_best_effort(inner: &Arc<Inner>, local_id: &str) {
        let (variant, key) = {
            let session = inner.session.lock().await;
            (session.encryption.variant, session.encryption.key)
        };
        let local_id = local_id.to_string();
        let send_update = Self::metadata_sender(inner);
        let mut version = inner.session.lock().await.metadata_version;
        let mut metadata = inner.session.lock().await.metadata.clone();

        let result = updater::update_field(
            &inner.metadata_lock,
            &inner.backoff,
            variant,
            &key,
            &mut version,
            &mut metadata,
            move |m| {
                let mut m = m.clone();
                if let Some(queue) = m.message_queue_v1.as_mut() {
                    queue::clear_in_flight(queue, &local_id);
                }
                m
            },
            send_update,
        )
        .await;

        if result.is_ok() {
            let mut session = inner.session.lock().await;
            session.metadata = metadata;
            session.metadata_version = version;
        } else {
            debug!("best-effort clear-in-flight did not land");
        }
    }

    /// A `send` closure for [`updater::update_field`] on the metadata field,
    /// addressed to this session over its socket.
    fn metadata_sender(
        inner: &Arc<Inner>,
    ) -> impl Fn(i64, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<AckOutcome>> + Send>>
    {
        let inner = inner.clone();
        move |expected_version, ciphertext| {
            let inner = inner.clone();
            Box::pin(async move {
                let sid = inner.session.lock().await.id.clone();
                let ack = inner
                    .session_socket
                    .send_ack(
                        "update-metadata",
                        serde_json::json!({
                            "sid": sid,
                            "expectedVersion": expected_version,
                            "metadata": ciphertext,
                        }),
                    )
                    .await?;
                Ok(parse_ack(ack))
            })
        }
    }

    fn agent_state_sender(
        inner: &Arc<Inner>,
    ) -> impl Fn(i64, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<AckOutcome>> + Send>>
    {
        let inner = inner.clone();
        move |expected_version, ciphertext| {
            let inner = inner.clone();
            Box::pin(async move {
                let sid = inner.session.lock().await.id.clone();
                let ack = inner
                    .session_socket
                    .send_ack(
                        "update-state",
                        serde_json::json!({
                            "sid": sid,
                            "expectedVersion": expected_version,
                            "agentState": ciphertext,
                        }),
                    )
                    .await?;
                Ok(parse_ack(ack))
            })
        }
    }

    /// `getOrCreateSession`-style snapshot sync (§4.6): fetch the session
    /// list, adopt this session's record if its version is newer. Best
    /// effort — failures are logged and swallowed.
    async fn snapshot_sync(inner: &Arc<Inner>) {
        inner
            .sync_lock
            .acquire(|| async {
                let still_unknown = {
                    let session = inner.session.lock().await;
                    session.metadata_version < 0 || session.agent_state_version < 0
                };
                if !still_unknown {
                    return;
                }
                let records = match inner.http.list_sessions(&inner.tracker).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "snapshot sync failed, will heal from socket updates");
                        return;
                    }
                };
                let session_id = inner.session.lock().await.id.clone();
                let Some(record) = records.into_iter().find(|r| r.id == session_id) else {
                    return;
                };

                // For a `dataKey` account, a record we didn't just create
                // ourselves carries the session key wrapped to our content
                // public key rather than in the clear; unwrap it before
                // trying to open anything, since `session.encryption.key`
                // may still hold the fresh key `resolve_session_encryption`
                // mints for brand-new registrations.
                if let Some(wrapped) = record.data_encryption_key.as_deref() {
                    match inner.credentials.unwrap_data_key(wrapped) {
                        Ok(real_key) => {
                            let mut session = inner.session.lock().await;
                            session.encryption.key = real_key;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to unwrap session data key from snapshot record");
                        }
                    }
                }

                let mut session = inner.session.lock().await;
                let (variant, key) = (session.encryption.variant, session.encryption.key);
                if record.metadata_version > session.metadata_version {
                    if let Some(metadata) = envelope::open::<Metadata>(variant, &key, &record.metadata) {
                        session.metadata = metadata;
                        session.metadata_version = record.metadata_version;
                    }
                }
                if let (Some(v), Some(ct)) = (record.agent_state_version, record.agent_state.as_deref()) {
                    if v > session.agent_state_version {
                        if let Some(state) = envelope::open::<AgentState>(variant, &key, ct) {
                            session.agent_state = Some(state);
                            session.agent_state_version = v;
                        }
                    }
                }
            })
            .await;
    }

    /// `waitForMetadataUpdate` (§4.6): resolves once a metadata-updated
    /// event fires, or `false` if `abort` fires first.
    pub async fn wait_for_metadata_update(&self, abort: impl std::future::Future<Output = ()>) -> bool {
        let needs_sync = {
            let session = self.inner.session.lock().await;
            session.metadata_version < 0 || session.agent_state_version < 0
        };
        if needs_sync {
            Self::snapshot_sync(&self.inner).await;
        }
        let mut epoch_rx = self.inner.metadata_epoch.subscribe();
        tokio::select! {
            result = epoch_rx.changed() => result.is_ok(),
            () = abort => false,
        }
    }

    /// `popPendingMessage` (§4.6): deliver the oldest queued user message
    /// with at-most-once semantics. Returns `false` if there was nothing to
    /// claim (or the client is closed/disconnected).
    pub async fn pop_pending_message(&self) -> Result<bool> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || !inner.session_socket.is_connected() {
            return Ok(false);
        }

        self.ensure_user_socket().await;

        let claim = inner
            .metadata_lock
            .acquire(|| async {
                let mut session = inner.session.lock().await;
                let now = now_ms();
                let queue = session
                    .metadata
                    .message_queue_v1
                    .get_or_insert_with(Default::default);
                queue::claim_next(queue, now)
            })
            .await;

        let Some(claim) = claim else {
            return Ok(false);
        };

        if claim.mutated {
            let (variant, key) = {
                let session = inner.session.lock().await;
                (session.encryption.variant, session.encryption.key)
            };
            let mut version = inner.session.lock().await.metadata_version;
            let mut metadata = inner.session.lock().await.metadata.clone();
            let claimed_local_id = claim.item.item.local_id.clone();
            let claimed_item = claim.item.item.clone();
            let claimed_at = claim.item.claimed_at;
            // Idempotent: if a version-mismatch forces `mutate` to replay
            // against the server's latest value, re-assert this exact claim
            // rather than re-running claim_next (which could grab a
            // different item if the rebased queue has changed).
            updater::update_field(
                &inner.metadata_lock,
                &inner.backoff,
                variant,
                &key,
                &mut version,
                &mut metadata,
                move |m| {
                    let mut m = m.clone();
                    let queue = m.message_queue_v1.get_or_insert_with(Default::default);
                    let already_in_flight = queue
                        .in_flight
                        .as_ref()
                        .is_some_and(|f| f.item.local_id == claimed_local_id);
                    if !already_in_flight {
                        queue.queue.retain(|q| q.local_id != claimed_local_id);
                        queue.in_flight = Some(InFlightItem {
                            item: claimed_item.clone(),
                            claimed_at,
                        });
                    }
                    m
                },
                Self::metadata_sender(inner),
            )
            .await?;
            let mut session = inner.session.lock().await;
            session.metadata = metadata;
            session.metadata_version = version;
        } else {
            // Pre-existing in-flight: try transcript recovery before re-emitting.
            let session_id = inner.session.lock().await.id.clone();
            if let Ok(recovered) =
                Self::try_transcript_recovery(inner, &session_id, &claim.item.item.local_id).await
            {
                if recovered {
                    return Ok(true);
                }
            }
        }

        let local_id = claim.item.item.local_id.clone();
        inner
            .pending_materialized
            .lock()
            .unwrap()
            .insert(local_id.clone());

        let session_id = inner.session.lock().await.id.clone();
        inner
            .session_socket
            .emit(
                "message",
                serde_json::json!({
                    "sid": session_id,
                    "message": claim.item.item.message,
                    "localId": local_id,
                }),
            )
            .await;

        let inner = inner.clone();
        let recovery_local_id = local_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECOVERY_TIMER_DELAY).await;
            let still_pending = inner
                .pending_materialized
                .lock()
                .unwrap()
                .contains(&recovery_local_id);
            if !still_pending {
                return;
            }
            let session_id = inner.session.lock().await.id.clone();
            let deadline = tokio::time::Instant::now() + RECOVERY_POLL_BUDGET;
            while tokio::time::Instant::now() < deadline {
                if let Ok(true) =
                    Self::try_transcript_recovery(&inner, &session_id, &recovery_local_id).await
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        Ok(true)
    }

    /// Scan message history for a committed message with `local_id`. If
    /// found, feed it through the normal decode pipeline and return `true`.
    async fn try_transcript_recovery(
        inner: &Arc<Inner>,
        session_id: &str,
        local_id: &str,
    ) -> Result<bool> {
        let messages = match inner.http.session_messages(&inner.tracker, session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!(error = %e, "transcript recovery http call failed, falling through to echo path");
                return Ok(false);
            }
        };
        let Some(found) = messages
            .into_iter()
            .find(|m| m.local_id.as_deref() == Some(local_id))
        else {
            return Ok(false);
        };

        inner.pending_materialized.lock().unwrap().remove(local_id);
        Self::decode_and_dispatch_message(inner, found.local_id, found.content).await;
        let local_id = local_id.to_string();
        let inner = inner.clone();
        tokio::spawn(async move { Self::clear_in_flight_best_effort(&inner, &local_id).await });
        Ok(true)
    }

    async fn ensure_user_socket(&self) {
        let inner = &self.inner;
        let wanted = inner.user_socket_wanted.fetch_add(1, Ordering::SeqCst) + 1;
        if !inner.user_socket.is_connected() {
            let user_socket = inner.user_socket.clone();
            let inner2 = inner.clone();
            let stop_rx = inner.user_stop.subscribe();
            tokio::spawn(async move {
                let on_event = {
                    let inner2 = inner2.clone();
                    move |event: String, data: Value, _ack_id: Option<String>| {
                        let inner2 = inner2.clone();
                        tokio::spawn(async move {
                            if event == "update" {
                                Self::handle_update(&inner2, data, Scope::UserObserver).await;
                            }
                        });
                    }
                };
                user_socket.run(stop_rx, || {}, || {}, on_event).await;
            });
            // Give the dial a moment; callers that race this are still safe
            // since emit() silently drops while disconnected.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(USER_SOCKET_IDLE_GRACE).await;
            let remaining = inner.user_socket_wanted.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 && inner.pending_materialized.lock().unwrap().is_empty() {
                inner.user_socket.close().await;
            }
        });
        let _ = wanted;
    }

    /// `discardPendingMessageQueueV1All` (§4.6 extra operations).
    pub async fn discard_pending_queue_all(&self, reason: DiscardReason) -> Result<usize> {
        let inner = &self.inner;
        let (variant, key) = {
            let session = inner.session.lock().await;
            (session.encryption.variant, session.encryption.key)
        };
        let mut version = inner.session.lock().await.metadata_version;
        let mut metadata = inner.session.lock().await.metadata.clone();
        let mut count = 0usize;

        updater::update_field(
            &inner.metadata_lock,
            &inner.backoff,
            variant,
            &key,
            &mut version,
            &mut metadata,
            move |m| {
                let mut m = m.clone();
                let queue = m.message_queue_v1.get_or_insert_with(Default::default);
                let mut discarded: Vec<DiscardedItem> = m.message_queue_v1_discarded.clone();
                let moved = queue::discard_all(queue, &mut discarded, now_ms(), reason);
                m.message_queue_v1_discarded = discarded;
                count = moved.len();
                m
            },
            Self::metadata_sender(inner),
        )
        .await?;

        let mut session = inner.session.lock().await;
        session.metadata = metadata;
        session.metadata_version = version;
        Ok(count)
    }

    /// `discardCommittedMessageLocalIds` (§4.6 extra operations).
    pub async fn discard_committed_message_local_ids(&self, ids: Vec<String>) -> Result<()> {
        let inner = &self.inner;
        let (variant, key) = {
            let session = inner.session.lock().await;
            (session.encryption.variant, session.encryption.key)
        };
        let mut version = inner.session.lock().await.metadata_version;
        let mut metadata = inner.session.lock().await.metadata.clone();

        updater::update_field(
            &inner.metadata_lock,
            &inner.backoff,
            variant,
            &key,
            &mut version,
            &mut metadata,
            move |m| {
                let mut m = m.clone();
                m.append_discarded_ids(ids.clone());
                m
            },
            Self::metadata_sender(inner),
        )
        .await?;

        let mut session = inner.session.lock().await;
        session.metadata = metadata;
        session.metadata_version = version;
        Ok(())
    }

    /// Apply a mutation to the session's agent state through C5, symmetric
    /// to metadata updates (§4.5: "agent state follows the same protocol").
    pub async fn update_agent_state(&self, mutate: impl Fn(&AgentState) -> AgentState) -> Result<()> {
        let inner = &self.inner;
        let (variant, key) = {
            let session = inner.session.lock().await;
            (session.encryption.variant, session.encryption.key)
        };
        let mut version = inner.session.lock().await.agent_state_version;
        let mut state = inner
            .session
            .lock()
            .await
            .agent_state
            .clone()
            .unwrap_or_default();

        updater::update_field(
            &inner.agent_state_lock,
            &inner.backoff,
            variant,
            &key,
            &mut version,
            &mut state,
            mutate,
            Self::agent_state_sender(inner),
        )
        .await?;

        let mut session = inner.session.lock().await;
        session.agent_state = Some(state);
        session.agent_state_version = version;
        Ok(())
    }

    /// Send a user-authored text message.
    pub async fn send_user_text(&self, text: &str) -> Result<()> {
        self.send_body(MessageBody {
            role: "user".into(),
            content: serde_json::json!({ "type": "text", "text": text }),
            meta: serde_json::json!({ "sentFrom": "cli" }),
        })
        .await
    }

    /// Send an agent ACP-tagged content envelope (tool-call, tool-result,
    /// message, reasoning, ...).
    pub async fn send_agent_acp(&self, content: Value) -> Result<()> {
        let content = normalize_tool_result(content);
        self.send_body(MessageBody {
            role: "agent".into(),
            content,
            meta: serde_json::json!({ "sentFrom": "cli" }),
        })
        .await
    }

    async fn send_body(&self, body: MessageBody) -> Result<()> {
        let inner = &self.inner;
        let (sid, variant, key) = {
            let session = inner.session.lock().await;
            (session.id.clone(), session.encryption.variant, session.encryption.key)
        };
        let ciphertext = envelope::seal(variant, &key, &body)?;
        inner
            .session_socket
            .emit(
                "message",
                serde_json::json!({ "sid": sid, "message": ciphertext }),
            )
            .await;
        Ok(())
    }

    /// Keep-alive (§4.6): volatile, dropped silently if not connected.
    pub async fn send_alive(&self, thinking: bool, mode: &str) {
        let sid = self.inner.session.lock().await.id.clone();
        self.inner
            .session_socket
            .emit(
                "session-alive",
                serde_json::json!({ "sid": sid, "time": now_ms(), "thinking": thinking, "mode": mode }),
            )
            .await;
    }

    /// Close the client: idempotent, tears down both sockets and clears
    /// the pending-materialized set. In-flight C5 retries observe `closed`
    /// through their own backoff loop timing out rather than being
    /// forcibly cancelled.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.pending_materialized.lock().unwrap().clear();
        let _ = self.inner.session_stop.send(true);
        let _ = self.inner.user_stop.send(true);
        self.inner.session_socket.close().await;
        self.inner.user_socket.close().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Session,
    UserObserver,
}

/// Heuristically infer `isError=true` on a tool-result content envelope
/// whose output record shows an error/failed status (§4.6).
fn normalize_tool_result(mut content: Value) -> Value {
    if content.get("type").and_then(Value::as_str) != Some("tool-result") {
        return content;
    }
    let looks_failed = content
        .get("output")
        .map(|output| {
            let status = output.get("status").and_then(Value::as_str);
            matches!(status, Some("error") | Some("failed"))
                || output.get("error").is_some()
        })
        .unwrap_or(false);
    if looks_failed {
        if let Some(obj) = content.as_object_mut() {
            obj.entry("isError").or_insert(Value::Bool(true));
        }
    }
    content
}

fn parse_ack(ack: Value) -> AckOutcome {
    match ack.get("result").and_then(Value::as_str) {
        Some("success") => AckOutcome::Success {
            version: ack.get("version").and_then(Value::as_i64).unwrap_or(0),
        },
        Some("version-mismatch") => AckOutcome::VersionMismatch {
            version: ack.get("version").and_then(Value::as_i64).unwrap_or(0),
            ciphertext: ack
                .get("metadata")
                .or_else(|| ack.get("agentState"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        _ => AckOutcome::Error {
            message: ack
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown ack shape")
                .to_string(),
        },
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::EncryptionContext;
    use happy_crypto::AeadVariant;

    fn encryption() -> EncryptionContext {
        EncryptionContext {
            key: [6u8; 32],
            variant: AeadVariant::Legacy,
            wrapped_data_key: None,
        }
    }

    #[test]
    fn normalize_tool_result_sets_is_error_on_failed_status() {
        let content = serde_json::json!({
            "type": "tool-result",
            "output": {"status": "error"}
        });
        let normalized = normalize_tool_result(content);
        assert_eq!(normalized["isError"], true);
    }

    #[test]
    fn normalize_tool_result_leaves_successful_output_alone() {
        let content = serde_json::json!({
            "type": "tool-result",
            "output": {"status": "ok"}
        });
        let normalized = normalize_tool_result(content);
        assert!(normalized.get("isError").is_none());
    }

    #[test]
    fn normalize_tool_result_ignores_non_tool_result_content() {
        let content = serde_json::json!({"type": "text", "text": "hi"});
        let normalized = normalize_tool_result(content.clone());
        assert_eq!(normalized, content);
    }

    #[test]
    fn parse_ack_success() {
        let ack = serde_json::json!({"result": "success", "version": 4});
        match parse_ack(ack) {
            AckOutcome::Success { version } => assert_eq!(version, 4),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn parse_ack_version_mismatch_carries_ciphertext() {
        let ack = serde_json::json!({"result": "version-mismatch", "version": 9, "metadata": "Y2lwaGVy"});
        match parse_ack(ack) {
            AckOutcome::VersionMismatch { version, ciphertext } => {
                assert_eq!(version, 9);
                assert_eq!(ciphertext.as_deref(), Some("Y2lwaGVy"));
            }
            _ => panic!("expected version-mismatch"),
        }
    }

    #[tokio::test]
    async fn pop_pending_message_returns_false_when_queue_empty() {
        let session = Session::new("s1".into(), encryption());
        let http = Arc::new(HttpClient::new(
            reqwest::Client::new(),
            "http://localhost:1".into(),
            "tok".into(),
        ));
        let credentials = Credentials {
            token: "tok".into(),
            account_secret: [6u8; 32],
            encryption: crate::credentials::CredentialEncryption::Legacy,
        };
        let client = SessionClient::new(
            session,
            "ws://localhost:1",
            "tok",
            http,
            credentials,
            Arc::new(ConnectionTracker::new()),
        );
        // Socket never dialed successfully in this unit test; pop should
        // short-circuit on the disconnected check rather than hang.
        assert_eq!(client.pop_pending_message().await.unwrap(), false);
    }
}
