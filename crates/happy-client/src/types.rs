//! Wire and domain data model: sessions, metadata, agent state, machines,
//! and the server's `update` envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::EncryptionContext;
use crate::queue::MessageQueueV1;

/// `meta.summary` is a string in newer records and `{text, updatedAt}` in
/// historical ones; readers must tolerate both. Writers prefer the object form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Summary {
    Text(String),
    Detailed {
        text: String,
        #[serde(rename = "updatedAt")]
        updated_at: i64,
    },
}

/// Encrypted session metadata. Recognized fields are typed; anything this
/// client doesn't know about round-trips through `extra` unchanged, since
/// writes always produce a new record and must not drop fields other
/// collaborators wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode_updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_queue_v1: Option<MessageQueueV1>,
    /// Tail-retained, capped at 500 (`DISCARDED_IDS_CAP`).
    #[serde(default)]
    pub discarded_committed_message_local_ids: Vec<String>,
    /// Tail-retained, capped at 50 (`crate::queue::DISCARD_HISTORY_CAP`).
    #[serde(default)]
    pub message_queue_v1_discarded: Vec<crate::queue::DiscardedItem>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Cap on `discardedCommittedMessageLocalIds` (§4.6 extra operations, §8 property 6).
pub const DISCARDED_IDS_CAP: usize = 500;

impl Metadata {
    /// Append ids to the discarded-committed list, enforcing the 500 tail-retained cap.
    pub fn append_discarded_ids<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        self.discarded_committed_message_local_ids.extend(ids);
        let len = self.discarded_committed_message_local_ids.len();
        if len > DISCARDED_IDS_CAP {
            self.discarded_committed_message_local_ids
                .drain(0..len - DISCARDED_IDS_CAP);
        }
    }
}

/// Decision/request records inside `AgentState` are opaque JSON to this
/// client — it only inspects "is a request present", never tool-specific shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_by_user: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(default)]
    pub requests: HashMap<String, Value>,
    #[serde(default)]
    pub completed_requests: HashMap<String, Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AgentState {
    /// "Idle" per §3: not user-controlled and no pending requests.
    pub fn is_idle(&self) -> bool {
        self.controlled_by_user != Some(true) && self.requests.is_empty()
    }
}

/// A live session record held by the session sync client.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub seq: u64,
    pub metadata: Metadata,
    /// `-1` means "unknown, sync first".
    pub metadata_version: i64,
    pub agent_state: Option<AgentState>,
    pub agent_state_version: i64,
    pub encryption: EncryptionContext,
}

impl Session {
    pub fn new(id: String, encryption: EncryptionContext) -> Self {
        Self {
            id,
            seq: 0,
            metadata: Metadata::default(),
            metadata_version: -1,
            agent_state: None,
            agent_state_version: -1,
            encryption,
        }
    }
}

/// `status` is deliberately an open string ("running", "shutting-down", …
/// per §3) rather than a closed enum — the source never enumerates the
/// full set and this client doesn't interpret it beyond forcing "running"
/// on connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_requested_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_source: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Machine-scoped metadata. The source treats this as an opaque encrypted
/// map the same way session `Metadata` is, just without the message queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineMetadata {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// A live machine record held by the machine sync client.
#[derive(Clone)]
pub struct Machine {
    pub id: String,
    pub encryption: EncryptionContext,
    pub metadata: MachineMetadata,
    pub metadata_version: i64,
    pub daemon_state: Option<DaemonState>,
    pub daemon_state_version: i64,
}

impl Machine {
    pub fn new(id: String, encryption: EncryptionContext) -> Self {
        Self {
            id,
            encryption,
            metadata: MachineMetadata::default(),
            metadata_version: -1,
            daemon_state: None,
            daemon_state_version: -1,
        }
    }
}

/// Inbound message content, always `{t: "encrypted", c: base64}` on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum WireContent {
    Encrypted { c: String },
}

/// `body.message` of a `new-message` update.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub seq: u64,
    #[serde(default, rename = "localId")]
    pub local_id: Option<String>,
    pub content: WireContent,
}

/// A version + ciphertext pair as carried on `update-session`/`update-machine`
/// bodies for the metadata / agent-state / daemon-state fields.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionedBlob {
    pub version: i64,
    pub ciphertext: String,
}

/// `body` of a server `update` frame, discriminated by `t`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum UpdateBody {
    NewMessage {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        message: WireMessage,
    },
    UpdateSession {
        #[serde(default)]
        sid: Option<String>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        metadata: Option<VersionedBlob>,
        #[serde(default, rename = "agentState")]
        agent_state: Option<VersionedBlob>,
    },
    UpdateMachine {
        #[serde(default, rename = "machineId")]
        machine_id: Option<String>,
        #[serde(default)]
        metadata: Option<VersionedBlob>,
        #[serde(default, rename = "daemonState")]
        daemon_state: Option<VersionedBlob>,
    },
}

impl UpdateBody {
    /// `sid` and `id` are both accepted as the session identifier on
    /// `update-session`; either is authoritative when the other is absent.
    pub fn update_session_id(&self) -> Option<&str> {
        match self {
            UpdateBody::UpdateSession { sid, id, .. } => {
                sid.as_deref().or(id.as_deref())
            }
            _ => None,
        }
    }
}

/// Server → client `update(Update)` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub id: String,
    pub seq: u64,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub body: UpdateBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_accepts_bare_string() {
        let s: Summary = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(s, Summary::Text("hello".into()));
    }

    #[test]
    fn summary_accepts_detailed_object() {
        let s: Summary =
            serde_json::from_str(r#"{"text":"hi","updatedAt":42}"#).unwrap();
        assert_eq!(
            s,
            Summary::Detailed {
                text: "hi".into(),
                updated_at: 42
            }
        );
    }

    #[test]
    fn metadata_roundtrips_unknown_fields() {
        let raw = serde_json::json!({"path": "/tmp", "somethingNew": 7});
        let meta: Metadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(meta.path.as_deref(), Some("/tmp"));
        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["somethingNew"], 7);
    }

    #[test]
    fn agent_state_idle_rules() {
        let idle = AgentState::default();
        assert!(idle.is_idle());

        let controlled = AgentState {
            controlled_by_user: Some(true),
            ..Default::default()
        };
        assert!(!controlled.is_idle());

        let mut busy = AgentState::default();
        busy.requests.insert("r1".into(), serde_json::json!({}));
        assert!(!busy.is_idle());
    }

    #[test]
    fn update_session_id_prefers_sid() {
        let body = UpdateBody::UpdateSession {
            sid: Some("s1".into()),
            id: Some("ignored".into()),
            metadata: None,
            agent_state: None,
        };
        assert_eq!(body.update_session_id(), Some("s1"));
    }

    #[test]
    fn update_session_id_falls_back_to_id() {
        let body = UpdateBody::UpdateSession {
            sid: None,
            id: Some("s2".into()),
            metadata: None,
            agent_state: None,
        };
        assert_eq!(body.update_session_id(), Some("s2"));
    }

    #[test]
    fn discarded_ids_cap_enforced() {
        let mut meta = Metadata::default();
        meta.append_discarded_ids((0..DISCARDED_IDS_CAP + 10).map(|i| i.to_string()));
        assert_eq!(meta.discarded_committed_message_local_ids.len(), DISCARDED_IDS_CAP);
        assert_eq!(meta.discarded_committed_message_local_ids[0], "10");
    }

    #[test]
    fn update_new_message_decodes() {
        let raw = serde_json::json!({
            "id": "u1", "seq": 1, "createdAt": 1000,
            "body": {
                "t": "new-message",
                "sessionId": "s1",
                "message": {
                    "id": "m1", "seq": 1, "localId": "L1",
                    "content": {"t": "encrypted", "c": "YWJj"}
                }
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        match update.body {
            UpdateBody::NewMessage { session_id, message } => {
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert_eq!(message.local_id.as_deref(), Some("L1"));
            }
            _ => panic!("expected new-message"),
        }
    }
}
