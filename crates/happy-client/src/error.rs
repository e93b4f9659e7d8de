//! Client-level error taxonomy.
//!
//! Mirrors the propagation rule: offline/version-mismatch/decrypt/parse
//! failures are recovered internally and never reach this type; only auth
//! conflicts and genuinely hard errors do.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport (HTTP or socket) is unreachable. Recoverable: callers
    /// should treat this as "proceed offline", not as a fatal condition.
    #[error("transport offline: {0}")]
    Offline(String),

    /// Server rejected bootstrap with 401/403/409 — reachable but refused.
    #[error("{operation} failed ({status}): {message}")]
    AuthConflict {
        operation: String,
        status: u16,
        message: String,
    },

    /// Unexpected HTTP status outside the tolerant ranges, or exhausted backoff.
    #[error("{operation} failed ({status}): {message}")]
    Hard {
        operation: String,
        status: String,
        message: String,
    },

    /// The client has been closed; the caller attempted an operation that
    /// requires a live client.
    #[error("client is closed")]
    Closed,

    /// A C5 write exhausted its retry budget without a definitive ack.
    #[error("update retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Local version is unknown and snapshot sync did not resolve it.
    #[error("version unknown for {field}, snapshot sync did not resolve it")]
    VersionUnknown { field: &'static str },

    #[error(transparent)]
    Crypto(#[from] happy_crypto::CryptoError),

    #[error(transparent)]
    Core(#[from] happy_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
