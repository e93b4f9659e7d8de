//! Machine sync client (C7, §4.7): single socket, same optimistic-concurrency
//! update protocol as C6's session side, applied to `MachineMetadata` and
//! `DaemonState`, plus the RPC entry point for daemon control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::classifier::ConnectionTracker;
use crate::envelope;
use crate::error::Result;
use crate::http::HttpClient;
use crate::lock::AsyncLock;
use crate::rpc::{RpcError, RpcHandler, RpcRegistry};
use crate::transport::EventSocket;
use crate::types::{DaemonState, Machine, MachineMetadata};
use crate::updater::{self, AckOutcome};

/// `machine-alive` cadence (§4.7).
const ALIVE_INTERVAL: Duration = Duration::from_secs(20);

struct Inner {
    machine: TokioMutex<Machine>,
    socket: Arc<EventSocket>,
    rpc: RpcRegistry,
    http: Arc<HttpClient>,
    tracker: Arc<ConnectionTracker>,
    backoff: BackoffPolicy,
    metadata_lock: AsyncLock,
    daemon_state_lock: AsyncLock,
    closed: AtomicBool,
    // See session_client's Inner: held for the client's lifetime so the
    // reconnect backoff in EventSocket::run isn't starved by a dropped sender.
    stop: watch::Sender<bool>,
}

/// Handle to a live machine-sync client. Cheap to clone.
#[derive(Clone)]
pub struct MachineClient {
    inner: Arc<Inner>,
}

impl MachineClient {
    /// Build a client for `machine`, wiring its socket against `base_url`.
    /// Does not connect; call [`Self::connect`] to start the socket loop.
    pub fn new(
        machine: Machine,
        base_url: &str,
        token: &str,
        http: Arc<HttpClient>,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        let machine_id = machine.id.clone();
        let socket = EventSocket::new(
            format!("{base_url}/v1/updates"),
            token,
            vec![
                ("clientType".into(), "machine-scoped".into()),
                ("machineId".into(), machine_id.clone()),
            ],
        );
        let (stop, _rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                machine: TokioMutex::new(machine),
                socket,
                rpc: RpcRegistry::new(machine_id),
                http,
                tracker,
                backoff: BackoffPolicy::default(),
                metadata_lock: AsyncLock::new(),
                daemon_state_lock: AsyncLock::new(),
                closed: AtomicBool::new(false),
                stop,
            }),
        }
    }

    /// Register a daemon-control RPC handler with no extra validation
    /// (`stop-session`, `stop-daemon`: §4.7 names only `directory` and the
    /// resume fields as validated, not these two).
    pub fn register_rpc(&self, method: impl Into<String>, handler: RpcHandler) {
        self.inner.rpc.register(method, handler);
    }

    /// Register `spawn-happy-session`, rejecting an empty `directory`
    /// before the caller-provided handler ever sees it.
    pub fn register_spawn_happy_session(&self, handler: RpcHandler) {
        self.register_validated("spawn-happy-session", validate_directory, handler);
    }

    /// Register `resume-session`, rejecting a missing `directory`,
    /// `sessionId`, `sessionEncryptionKeyBase64`, or a variant other than
    /// `dataKey` before the caller-provided handler ever sees it.
    pub fn register_resume_session(&self, handler: RpcHandler) {
        self.register_validated("resume-session", validate_resume_session, handler);
    }

    fn register_validated(
        &self,
        method: &str,
        validate: impl Fn(&Value) -> std::result::Result<(), RpcError> + Send + Sync + 'static,
        handler: RpcHandler,
    ) {
        let wrapped: RpcHandler = Arc::new(move |params: Value| {
            let handler = handler.clone();
            let outcome = validate(&params);
            Box::pin(async move {
                outcome?;
                handler(params).await
            })
        });
        self.inner.rpc.register(method, wrapped);
    }

    /// Start the socket's read loop and the `machine-alive` liveness loop.
    pub fn connect(&self) {
        let inner = self.inner.clone();
        let stop_rx = inner.stop.subscribe();
        tokio::spawn(async move {
            let on_connect = {
                let inner = inner.clone();
                move || {
                    let inner = inner.clone();
                    tokio::spawn(async move { Self::on_connect(inner).await });
                }
            };
            let on_disconnect = || {};
            let on_event = {
                let inner = inner.clone();
                move |event: String, data: Value, ack_id: Option<String>| {
                    let inner = inner.clone();
                    tokio::spawn(async move { Self::on_event(inner, event, data, ack_id).await });
                }
            };
            inner
                .socket
                .clone()
                .run(stop_rx, on_connect, on_disconnect, on_event)
                .await;
        });

        let inner = self.inner.clone();
        let mut stop_rx = self.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(ALIVE_INTERVAL) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
                if inner.closed.load(Ordering::SeqCst) || !inner.socket.is_connected() {
                    continue;
                }
                let machine_id = inner.machine.lock().await.id.clone();
                inner
                    .socket
                    .emit(
                        "machine-alive",
                        serde_json::json!({ "machineId": machine_id, "time": now_ms() }),
                    )
                    .await;
            }
        });
    }

    async fn on_connect(inner: Arc<Inner>) {
        info!("machine socket connected, re-registering rpc handlers");
        for method in inner.rpc.qualified_names() {
            inner
                .socket
                .emit("register-rpc-handler", serde_json::json!({ "method": method }))
                .await;
        }

        let needs_sync = {
            let machine = inner.machine.lock().await;
            machine.metadata_version < 0 || machine.daemon_state_version < 0
        };
        if needs_sync {
            Self::snapshot_sync(&inner).await;
        }

        Self::force_running_daemon_state(&inner).await;
    }

    async fn on_event(inner: Arc<Inner>, event: String, data: Value, ack_id: Option<String>) {
        match event.as_str() {
            "update" => Self::handle_update(&inner, data).await,
            "rpc-request" => Self::handle_rpc_request(&inner, data, ack_id).await,
            other => debug!(event = other, "unhandled machine-socket event"),
        }
    }

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
            let machine = inner.machine.lock().await;
            (machine.encryption.variant, machine.encryption.key)
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
        inner.socket.reply_ack(&ack_id, ack).await;
    }

    /// §4.7: adopt metadata/daemon-state fields carried on `update-machine`
    /// when they name this machine and carry a newer version.
    async fn handle_update(inner: &Arc<Inner>, data: Value) {
        let update: crate::types::Update = match serde_json::from_value(data) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "dropping malformed update frame");
                return;
            }
        };
        let crate::types::UpdateBody::UpdateMachine {
            machine_id,
            metadata,
            daemon_state,
        } = update.body
        else {
            debug!("ignoring non-update-machine body on machine socket");
            return;
        };

        let our_id = inner.machine.lock().await.id.clone();
        if machine_id.as_deref() != Some(our_id.as_str()) {
            return;
        }

        let mut machine = inner.machine.lock().await;
        let variant = machine.encryption.variant;
        let key = machine.encryption.key;

        if let Some(blob) = metadata {
            if blob.version > machine.metadata_version {
                if let Some(decoded) = envelope::open::<MachineMetadata>(variant, &key, &blob.ciphertext) {
                    machine.metadata = decoded;
                    machine.metadata_version = blob.version;
                }
            }
        }
        if let Some(blob) = daemon_state {
            if blob.version > machine.daemon_state_version {
                if let Some(decoded) = envelope::open::<DaemonState>(variant, &key, &blob.ciphertext) {
                    machine.daemon_state = Some(decoded);
                    machine.daemon_state_version = blob.version;
                }
            }
        }
    }

    /// `updateMachineMetadata` (§4.7): C5 on `machine-update-metadata`.
    pub async fn update_machine_metadata(
        &self,
        mutate: impl Fn(&MachineMetadata) -> MachineMetadata,
    ) -> Result<()> {
        let inner = &self.inner;
        let (variant, key) = {
            let machine = inner.machine.lock().await;
            (machine.encryption.variant, machine.encryption.key)
        };
        let mut version = inner.machine.lock().await.metadata_version;
        let mut metadata = inner.machine.lock().await.metadata.clone();
        let send = Self::metadata_sender(inner);

        let result = updater::update_field(
            &inner.metadata_lock,
            &inner.backoff,
            variant,
            &key,
            &mut version,
            &mut metadata,
            mutate,
            send,
        )
        .await;

        if result.is_ok() {
            let mut machine = inner.machine.lock().await;
            machine.metadata = metadata;
            machine.metadata_version = version;
        }
        result
    }

    /// `updateDaemonState` (§4.7): C5 on `machine-update-state`.
    pub async fn update_daemon_state(
        &self,
        mutate: impl Fn(&DaemonState) -> DaemonState,
    ) -> Result<()> {
        Self::update_daemon_state_inner(&self.inner, mutate).await
    }

    async fn update_daemon_state_inner(
        inner: &Arc<Inner>,
        mutate: impl Fn(&DaemonState) -> DaemonState,
    ) -> Result<()> {
        let (variant, key) = {
            let machine = inner.machine.lock().await;
            (machine.encryption.variant, machine.encryption.key)
        };
        let mut version = inner.machine.lock().await.daemon_state_version;
        let mut daemon_state = inner
            .machine
            .lock()
            .await
            .daemon_state
            .clone()
            .unwrap_or_default();
        let send = Self::daemon_state_sender(inner);

        let result = updater::update_field(
            &inner.daemon_state_lock,
            &inner.backoff,
            variant,
            &key,
            &mut version,
            &mut daemon_state,
            mutate,
            send,
        )
        .await;

        if result.is_ok() {
            let mut machine = inner.machine.lock().await;
            machine.daemon_state = Some(daemon_state);
            machine.daemon_state_version = version;
        }
        result
    }

    /// Overwrite any stale record from a previous daemon generation
    /// (§4.7: "forces status=running, pid=currentPid, startedAt=now").
    /// Best effort: failures are logged, the daemon keeps running.
    async fn force_running_daemon_state(inner: &Arc<Inner>) {
        let needs_version = inner.machine.lock().await.daemon_state_version < 0;
        if needs_version {
            debug!("daemon-state version still unknown after snapshot sync, skipping force");
            return;
        }
        let pid = std::process::id();
        let started_at = now_ms();
        let result = Self::update_daemon_state_inner(inner, move |state| {
            let mut state = state.clone();
            state.status = Some("running".into());
            state.pid = Some(pid);
            state.started_at = Some(started_at);
            state
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to force running daemon state on connect");
        }
    }

    fn metadata_sender(
        inner: &Arc<Inner>,
    ) -> impl Fn(i64, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<AckOutcome>> + Send>>
    {
        let inner = inner.clone();
        move |expected_version, ciphertext| {
            let inner = inner.clone();
            Box::pin(async move {
                let machine_id = inner.machine.lock().await.id.clone();
                let ack = inner
                    .socket
                    .send_ack(
                        "machine-update-metadata",
                        serde_json::json!({
                            "machineId": machine_id,
                            "expectedVersion": expected_version,
                            "metadata": ciphertext,
                        }),
                    )
                    .await?;
                Ok(parse_ack(ack))
            })
        }
    }

    fn daemon_state_sender(
        inner: &Arc<Inner>,
    ) -> impl Fn(i64, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<AckOutcome>> + Send>>
    {
        let inner = inner.clone();
        move |expected_version, ciphertext| {
            let inner = inner.clone();
            Box::pin(async move {
                let machine_id = inner.machine.lock().await.id.clone();
                let ack = inner
                    .socket
                    .send_ack(
                        "machine-update-state",
                        serde_json::json!({
                            "machineId": machine_id,
                            "expectedVersion": expected_version,
                            "daemonState": ciphertext,
                        }),
                    )
                    .await?;
                Ok(parse_ack(ack))
            })
        }
    }

    /// `GET /v1/machines`-equivalent snapshot sync is not exposed by the
    /// bootstrap API (§6 lists only `POST /v1/machines`); this falls back
    /// to re-registering, which the server answers with the current record
    /// on the next `update-machine` push. Kept as a hook so a future
    /// `GET /v1/machines/{id}` can slot in without touching callers.
    async fn snapshot_sync(_inner: &Arc<Inner>) {
        debug!("no machine snapshot endpoint, waiting for update-machine push");
    }

    /// Tear down the client: idempotent, stops both the socket's read loop
    /// and the liveness loop.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.stop.send(true);
        self.inner.socket.close().await;
    }
}

fn validate_directory(params: &Value) -> std::result::Result<(), RpcError> {
    match params.get("directory").and_then(Value::as_str) {
        Some(dir) if !dir.is_empty() => Ok(()),
        _ => Err(RpcError::new("invalid_params", "directory must be non-empty")),
    }
}

fn validate_resume_session(params: &Value) -> std::result::Result<(), RpcError> {
    validate_directory(params)?;

    match params.get("sessionId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => {}
        _ => return Err(RpcError::new("invalid_params", "sessionId must be non-empty")),
    }
    match params.get("sessionEncryptionKeyBase64").and_then(Value::as_str) {
        Some(key) if !key.is_empty() => {}
        _ => {
            return Err(RpcError::new(
                "invalid_params",
                "sessionEncryptionKeyBase64 is required",
            ))
        }
    }
    match params.get("sessionEncryptionVariant").and_then(Value::as_str) {
        Some("dataKey") => Ok(()),
        _ => Err(RpcError::new(
            "invalid_params",
            "sessionEncryptionVariant must be dataKey",
        )),
    }
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
                .or_else(|| ack.get("daemonState"))
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

    #[test]
    fn validate_directory_rejects_empty() {
        let params = serde_json::json!({ "directory": "" });
        assert!(validate_directory(&params).is_err());
    }

    #[test]
    fn validate_directory_accepts_non_empty() {
        let params = serde_json::json!({ "directory": "/tmp/work" });
        assert!(validate_directory(&params).is_ok());
    }

    #[test]
    fn validate_resume_session_requires_data_key_variant() {
        let params = serde_json::json!({
            "directory": "/tmp/work",
            "sessionId": "s1",
            "sessionEncryptionKeyBase64": "a2V5",
            "sessionEncryptionVariant": "legacy",
        });
        let err = validate_resume_session(&params).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn validate_resume_session_accepts_full_params() {
        let params = serde_json::json!({
            "directory": "/tmp/work",
            "sessionId": "s1",
            "sessionEncryptionKeyBase64": "a2V5",
            "sessionEncryptionVariant": "dataKey",
        });
        assert!(validate_resume_session(&params).is_ok());
    }

    #[test]
    fn validate_resume_session_rejects_missing_key() {
        let params = serde_json::json!({
            "directory": "/tmp/work",
            "sessionId": "s1",
            "sessionEncryptionVariant": "dataKey",
        });
        assert!(validate_resume_session(&params).is_err());
    }

    #[test]
    fn parse_ack_reads_daemon_state_mismatch_payload() {
        let ack = serde_json::json!({
            "result": "version-mismatch",
            "version": 4,
            "daemonState": "Y2lwaGVy",
        });
        match parse_ack(ack) {
            AckOutcome::VersionMismatch { version, ciphertext } => {
                assert_eq!(version, 4);
                assert_eq!(ciphertext.as_deref(), Some("Y2lwaGVy"));
            }
            _ => panic!("expected version mismatch"),
        }
    }
}
