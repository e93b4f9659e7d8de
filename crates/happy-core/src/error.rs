//! Shared error types for the session-sync client.

use thiserror::Error;

/// Result type alias using the client's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error taxonomy. Transport/HTTP failures are classified further
/// by the offline/error classifier rather than surfaced raw.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be resolved (e.g. no home directory).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials file was missing, malformed, or had bad permissions.
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// A hard, non-recoverable failure surfaced to the operator.
    #[error("{operation} failed ({status}): {message}")]
    Hard {
        operation: String,
        status: String,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
