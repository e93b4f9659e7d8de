//! Offline/error classification and the process-wide connection state (C8).
//!
//! Every HTTP bootstrap call and socket ack failure funnels through
//! [`classify_status`] / [`classify_reqwest_error`] so the rest of the
//! client reacts to the same four buckets: offline (proceed degraded),
//! a retryable server error (keep trying), an auth conflict (stop and
//! surface), or a hard error (stop and surface, different wording).

use tokio::sync::watch;

use crate::error::ClientError;

/// One HTTP/socket failure, bucketed the way every retry loop in this
/// client branches on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Unreachable: DNS, connect, or timeout failure. Treated as "offline",
    /// not fatal.
    Offline,
    /// 5xx or similar: the server is there but struggling. Worth retrying.
    RetryableServer { status: u16 },
    /// 401/403/409: reachable and refusing. Not retried.
    AuthConflict { status: u16 },
    /// Anything else unexpected.
    Hard { status: String },
}

impl Classification {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::Offline | Classification::RetryableServer { .. })
    }

    pub fn into_error(self, operation: &str, message: String) -> ClientError {
        match self {
            Classification::Offline => ClientError::Offline(message),
            Classification::RetryableServer { status } => ClientError::Hard {
                operation: operation.to_string(),
                status: status.to_string(),
                message,
            },
            Classification::AuthConflict { status } => ClientError::AuthConflict {
                operation: operation.to_string(),
                status,
                message,
            },
            Classification::Hard { status } => ClientError::Hard {
                operation: operation.to_string(),
                status,
                message,
            },
        }
    }
}

/// Classify a status code returned by a reachable server.
pub fn classify_status(status: reqwest::StatusCode) -> Classification {
    match status.as_u16() {
        401 | 403 | 409 => Classification::AuthConflict {
            status: status.as_u16(),
        },
        500..=599 => Classification::RetryableServer {
            status: status.as_u16(),
        },
        other => Classification::Hard {
            status: other.to_string(),
        },
    }
}

/// Classify a status code from an HTTP bootstrap call (§4.8): session
/// create, machine register, snapshot sync, transcript recovery. `404`
/// on these endpoints means "server not ready yet", not "not found" —
/// treated the same as a network-level offline failure.
pub fn classify_bootstrap_status(status: reqwest::StatusCode) -> Classification {
    if status.as_u16() == 404 {
        return Classification::Offline;
    }
    classify_status(status)
}

/// Classify a transport-level failure (no response received at all).
pub fn classify_reqwest_error(err: &reqwest::Error) -> Classification {
    if err.is_connect() || err.is_timeout() {
        return Classification::Offline;
    }
    match err.status() {
        Some(status) => classify_status(status),
        None => Classification::Hard {
            status: "transport".into(),
        },
    }
}

/// Process-wide connectivity state, shared across the session and machine
/// clients. `Recovered` is a one-tick transitional state: the first success
/// after a run of failures reports `Recovered`, the next reports `Healthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Healthy,
    Failing,
    Recovered,
}

pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Healthy);
        Self { tx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn record_failure(&self) {
        if self.state() != ConnectionState::Failing {
            let _ = self.tx.send(ConnectionState::Failing);
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            ConnectionState::Failing => {
                let _ = self.tx.send(ConnectionState::Recovered);
            }
            ConnectionState::Recovered => {
                let _ = self.tx.send(ConnectionState::Healthy);
            }
            ConnectionState::Healthy => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_buckets() {
        assert_eq!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED),
            Classification::AuthConflict { status: 401 }
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::CONFLICT),
            Classification::AuthConflict { status: 409 }
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            Classification::RetryableServer { status: 502 }
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::NOT_FOUND),
            Classification::Hard { status: "404".into() }
        );
    }

    #[test]
    fn bootstrap_404_is_offline_not_hard() {
        assert_eq!(
            classify_bootstrap_status(reqwest::StatusCode::NOT_FOUND),
            Classification::Offline
        );
        assert_eq!(
            classify_bootstrap_status(reqwest::StatusCode::CONFLICT),
            Classification::AuthConflict { status: 409 }
        );
    }

    #[test]
    fn retryable_buckets_are_offline_and_server_errors() {
        assert!(Classification::Offline.is_retryable());
        assert!(Classification::RetryableServer { status: 503 }.is_retryable());
        assert!(!Classification::AuthConflict { status: 401 }.is_retryable());
        assert!(!Classification::Hard { status: "404".into() }.is_retryable());
    }

    #[test]
    fn tracker_starts_healthy() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.state(), ConnectionState::Healthy);
    }

    #[test]
    fn tracker_goes_failing_then_recovers_then_settles_healthy() {
        let tracker = ConnectionTracker::new();
        tracker.record_failure();
        assert_eq!(tracker.state(), ConnectionState::Failing);
        tracker.record_failure();
        assert_eq!(tracker.state(), ConnectionState::Failing, "repeated failure is a no-op");

        tracker.record_success();
        assert_eq!(tracker.state(), ConnectionState::Recovered);
        tracker.record_success();
        assert_eq!(tracker.state(), ConnectionState::Healthy);
        tracker.record_success();
        assert_eq!(tracker.state(), ConnectionState::Healthy, "already healthy is a no-op");
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let tracker = ConnectionTracker::new();
        let mut rx = tracker.subscribe();
        tracker.record_failure();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Failing);
    }
}
