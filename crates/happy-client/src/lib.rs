//! Client library for the Happy end-to-end-encrypted agent-session protocol
//! (§1-§2): a dual-socket session-sync client, a symmetric machine-sync
//! client, and the envelope/crypto/bootstrap layers they both sit on.
//!
//! Server content is opaque to this crate's own transport: every field it
//! writes is sealed with [`happy_crypto`] before it ever reaches a socket or
//! an HTTP body, and opened the same way on the way back in.

pub mod backoff;
pub mod classifier;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod http;
pub mod lock;
pub mod machine_client;
pub mod queue;
pub mod rpc;
pub mod session_client;
pub mod transport;
pub mod types;
pub mod updater;

pub use classifier::{ConnectionState, ConnectionTracker};
pub use credentials::{CredentialEncryption, Credentials, EncryptionContext};
pub use error::{ClientError, Result};
pub use http::HttpClient;
pub use machine_client::MachineClient;
pub use rpc::{RpcError, RpcHandler};
pub use session_client::{IncomingEvent, MessageBody, SessionClient};
pub use types::{AgentState, DaemonState, Machine, MachineMetadata, Metadata, Session};
