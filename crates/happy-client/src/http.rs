//! HTTP bootstrap calls (§6): session/machine registration, snapshot sync,
//! transcript recovery, and the vendor-token relay. Every call here is
//! wrapped by C8's classifier — callers get a [`ClientError`] that already
//! distinguishes offline/auth-conflict/hard, never a raw `reqwest::Error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classifier::{classify_bootstrap_status, classify_reqwest_error, ConnectionTracker};
use crate::error::{ClientError, Result};
use crate::types::WireMessage;

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub tag: String,
    pub metadata: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "agentState")]
    pub agent_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "dataEncryptionKey")]
    pub data_encryption_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateMachineRequest {
    pub id: String,
    pub metadata: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "daemonState")]
    pub daemon_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "dataEncryptionKey")]
    pub data_encryption_key: Option<String>,
}

/// A session record as returned by `POST /v1/sessions` and `GET /v1/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(rename = "metadataVersion")]
    pub metadata_version: i64,
    pub metadata: String,
    #[serde(default, rename = "agentStateVersion")]
    pub agent_state_version: Option<i64>,
    #[serde(default, rename = "agentState")]
    pub agent_state: Option<String>,
    /// Present only for `dataKey` accounts: the wrapped session key, echoed
    /// back so a freshly-hydrated client (e.g. from the list endpoint) can
    /// unwrap it the same way it would on first create (§3).
    #[serde(default, rename = "dataEncryptionKey")]
    pub data_encryption_key: Option<String>,
}

/// A machine record as returned by `POST /v1/machines`.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    #[serde(rename = "metadataVersion")]
    pub metadata_version: i64,
    pub metadata: String,
    #[serde(default, rename = "daemonStateVersion")]
    pub daemon_state_version: Option<i64>,
    #[serde(default, rename = "daemonState")]
    pub daemon_state: Option<String>,
    #[serde(default, rename = "dataEncryptionKey")]
    pub data_encryption_key: Option<String>,
}

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, base_url: String, token: String) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        tracker: &ConnectionTracker,
        operation: &str,
        request: reqwest::RequestBuilder,
        body: Option<&B>,
    ) -> Result<T> {
        let mut request = request.bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracker.record_failure();
                let classification = classify_reqwest_error(&e);
                return Err(classification.into_error(operation, e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let classification = classify_bootstrap_status(status);
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            if classification.is_retryable() {
                tracker.record_failure();
            }
            return Err(classification.into_error(operation, message));
        }

        tracker.record_success();
        response.json::<T>().await.map_err(ClientError::Http)
    }

    /// `POST /v1/sessions`.
    pub async fn create_session(
        &self,
        tracker: &ConnectionTracker,
        request: &CreateSessionRequest,
    ) -> Result<SessionRecord> {
        self.send_json(
            tracker,
            "create-session",
            self.client.post(self.url("/v1/sessions")),
            Some(request),
        )
        .await
    }

    /// `POST /v1/machines`.
    pub async fn create_machine(
        &self,
        tracker: &ConnectionTracker,
        request: &CreateMachineRequest,
    ) -> Result<MachineRecord> {
        self.send_json(
            tracker,
            "create-machine",
            self.client.post(self.url("/v1/machines")),
            Some(request),
        )
        .await
    }

    /// `GET /v1/sessions` — used for snapshot sync.
    pub async fn list_sessions(&self, tracker: &ConnectionTracker) -> Result<Vec<SessionRecord>> {
        self.send_json::<(), _>(
            tracker,
            "list-sessions",
            self.client.get(self.url("/v1/sessions")),
            None,
        )
        .await
    }

    /// `GET /v1/sessions/{id}/messages` — used for transcript recovery.
    pub async fn session_messages(
        &self,
        tracker: &ConnectionTracker,
        session_id: &str,
    ) -> Result<Vec<WireMessage>> {
        self.send_json::<(), _>(
            tracker,
            "session-messages",
            self.client
                .get(self.url(&format!("/v1/sessions/{session_id}/messages"))),
            None,
        )
        .await
    }

    /// `POST /v1/connect/{vendor}/register` — opaque passthrough.
    pub async fn vendor_register(
        &self,
        tracker: &ConnectionTracker,
        vendor: &str,
        body: &Value,
    ) -> Result<Value> {
        self.send_json(
            tracker,
            "vendor-register",
            self.client
                .post(self.url(&format!("/v1/connect/{vendor}/register"))),
            Some(body),
        )
        .await
    }

    /// `GET /v1/connect/{vendor}/token` — opaque passthrough.
    pub async fn vendor_token(&self, tracker: &ConnectionTracker, vendor: &str) -> Result<Value> {
        self.send_json::<(), _>(
            tracker,
            "vendor-token",
            self.client
                .get(self.url(&format!("/v1/connect/{vendor}/token"))),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_request_omits_absent_optionals() {
        let request = CreateSessionRequest {
            tag: "cli".into(),
            metadata: "Y2lwaGVy".into(),
            agent_state: None,
            data_encryption_key: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("agentState").is_none());
        assert!(json.get("dataEncryptionKey").is_none());
    }

    #[test]
    fn session_record_tolerates_missing_agent_state() {
        let raw = serde_json::json!({
            "id": "s1",
            "metadataVersion": 3,
            "metadata": "Y2lwaGVy"
        });
        let record: SessionRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.metadata_version, 3);
        assert!(record.agent_state.is_none());
    }
}
