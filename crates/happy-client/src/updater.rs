//! Concurrency-controlled state updater (C5, §4.5).
//!
//! One field (metadata, agent state, daemon state) is updated at a time:
//! mutate locally, encrypt under the next version, send, and on a
//! version-mismatch ack adopt the server's value and replay the same
//! mutation before retrying. [`crate::lock::AsyncLock`] keeps concurrent
//! local writers from racing each other; [`crate::backoff`] bounds retries.
//!
//! This module knows nothing about sockets — callers supply `send` as a
//! plain async closure, so it works the same whether the ack travels over
//! the session socket, the machine socket, or (in tests) a fake.

use std::future::Future;

use happy_crypto::AeadVariant;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ClientError, Result};
use crate::lock::AsyncLock;
use crate::{backoff::BackoffPolicy, envelope};

/// What the other side said about one update attempt.
pub enum AckOutcome {
    /// Applied; the server's new version number.
    Success { version: i64 },
    /// Rejected: `version` is the server's current version, `ciphertext`
    /// its current encrypted value (when the server chooses to include it).
    VersionMismatch {
        version: i64,
        ciphertext: Option<String>,
    },
    /// Any other ack-carried failure (validation, not-found, ...).
    Error { message: String },
}

/// Apply `mutate` to `*value`, push it to the server under `*version + 1`,
/// and keep retrying (replaying `mutate` against the server's latest value
/// on every version-mismatch) until it lands or the backoff budget runs out.
///
/// `*version` must already be known (`>= 0`); callers are responsible for
/// resolving an unknown (`-1`) version via a snapshot fetch first.
pub async fn update_field<T, S, Fut>(
    lock: &AsyncLock,
    backoff: &BackoffPolicy,
    variant: AeadVariant,
    key: &[u8; 32],
    version: &mut i64,
    value: &mut T,
    mutate: impl FnMut(&T) -> T,
    send: S,
) -> Result<()>
where
    T: Serialize + DeserializeOwned,
    S: Fn(i64, String) -> Fut,
    Fut: Future<Output = Result<AckOutcome>>,
{
    if *version < 0 {
        return Err(ClientError::VersionUnknown { field: "unresolved" });
    }

    lock.acquire(move || async move {
        let mut mutate = mutate;
        *value = mutate(value);
        let mut attempt = 0u32;
        loop {
            let next_version = *version + 1;
            let ciphertext = envelope::seal(variant, key, &*value)?;

            match send(next_version, ciphertext).await {
                Ok(AckOutcome::Success { version: new_version }) => {
                    *version = new_version;
                    return Ok(());
                }
                Ok(AckOutcome::VersionMismatch {
                    version: server_version,
                    ciphertext: server_ciphertext,
                }) => {
                    if let Some(server_value) =
                        server_ciphertext.and_then(|ct| envelope::open::<T>(variant, key, &ct))
                    {
                        *value = mutate(&server_value);
                    }
                    // Only adopt the server's version when it's actually ahead of
                    // ours; a no-op mismatch (server version <= ours) still retries
                    // but must never rewind `*version`.
                    if server_version > *version {
                        *version = server_version;
                    }

                    attempt += 1;
                    if !backoff.should_retry(attempt) {
                        return Err(ClientError::RetriesExhausted { attempts: attempt });
                    }
                    tokio::time::sleep(backoff.delay_for_attempt(attempt - 1)).await;
                }
                Ok(AckOutcome::Error { message }) => {
                    return Err(ClientError::Hard {
                        operation: "update-field".into(),
                        status: "ack-error".into(),
                        message,
                    });
                }
                Err(e) => {
                    attempt += 1;
                    if !backoff.should_retry(attempt) {
                        return Err(e);
                    }
                    tokio::time::sleep(backoff.delay_for_attempt(attempt - 1)).await;
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Counter {
        n: u32,
    }

    #[tokio::test]
    async fn succeeds_on_first_ack() {
        let lock = AsyncLock::new();
        let backoff = BackoffPolicy {
            base_delay: std::time::Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        let key = [1u8; 32];
        let mut version = 0i64;
        let mut value = Counter { n: 0 };

        update_field(
            &lock,
            &backoff,
            AeadVariant::Legacy,
            &key,
            &mut version,
            &mut value,
            |c| Counter { n: c.n + 1 },
            |v, _ct| async move { Ok(AckOutcome::Success { version: v }) },
        )
        .await
        .unwrap();

        assert_eq!(version, 1);
        assert_eq!(value.n, 1);
    }

    #[tokio::test]
    async fn replays_mutation_after_version_mismatch() {
        let lock = AsyncLock::new();
        let backoff = BackoffPolicy {
            base_delay: std::time::Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        let key = [2u8; 32];
        let mut version = 0i64;
        let mut value = Counter { n: 0 };

        // The "server" is at version 5 with n=100; our stale write must
        // rebase onto that before it can land.
        let server_value = envelope::seal(AeadVariant::Legacy, &key, &Counter { n: 100 }).unwrap();
        let calls = AtomicU32::new(0);

        update_field(
            &lock,
            &backoff,
            AeadVariant::Legacy,
            &key,
            &mut version,
            &mut value,
            |c| Counter { n: c.n + 1 },
            |v, _ct| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                let server_value = server_value.clone();
                async move {
                    if call == 0 {
                        Ok(AckOutcome::VersionMismatch {
                            version: 5,
                            ciphertext: Some(server_value),
                        })
                    } else {
                        Ok(AckOutcome::Success { version: v })
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(version, 6);
        assert_eq!(value.n, 101, "mutation replayed against the server's n=100");
    }

    #[tokio::test]
    async fn exhausts_retries_on_repeated_mismatch() {
        let lock = AsyncLock::new();
        let backoff = BackoffPolicy {
            base_delay: std::time::Duration::from_millis(1),
            max_attempts: 2,
            ..BackoffPolicy::default()
        };
        let key = [3u8; 32];
        let mut version = 0i64;
        let mut value = Counter { n: 0 };

        let result = update_field(
            &lock,
            &backoff,
            AeadVariant::Legacy,
            &key,
            &mut version,
            &mut value,
            |c| Counter { n: c.n + 1 },
            |_v, _ct| async move {
                Ok(AckOutcome::VersionMismatch {
                    version: 1,
                    ciphertext: None,
                })
            },
        )
        .await;

        assert!(matches!(result, Err(ClientError::RetriesExhausted { attempts: 2 })));
    }

    #[tokio::test]
    async fn version_never_decreases_on_stale_mismatch() {
        let lock = AsyncLock::new();
        let backoff = BackoffPolicy {
            base_delay: std::time::Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        let key = [6u8; 32];
        let mut version = 5i64;
        let mut value = Counter { n: 5 };
        let calls = AtomicU32::new(0);

        // The ack reports a version behind ours; it must be treated as a
        // no-op (still retried) rather than rewinding `version` backwards.
        update_field(
            &lock,
            &backoff,
            AeadVariant::Legacy,
            &key,
            &mut version,
            &mut value,
            |c| Counter { n: c.n + 1 },
            |v, _ct| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Ok(AckOutcome::VersionMismatch {
                            version: 3,
                            ciphertext: None,
                        })
                    } else {
                        Ok(AckOutcome::Success { version: v })
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(version, 6, "version must never rewind below its pre-mismatch value");
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let lock = AsyncLock::new();
        let backoff = BackoffPolicy::default();
        let key = [4u8; 32];
        let mut version = -1i64;
        let mut value = Counter { n: 0 };

        let result = update_field(
            &lock,
            &backoff,
            AeadVariant::Legacy,
            &key,
            &mut version,
            &mut value,
            |c| c.clone(),
            |v, _ct| async move { Ok(AckOutcome::Success { version: v }) },
        )
        .await;

        assert!(matches!(result, Err(ClientError::VersionUnknown { .. })));
    }

    #[tokio::test]
    async fn serializes_concurrent_updates_to_same_field() {
        let lock = AsyncLock::new();
        let backoff = BackoffPolicy {
            base_delay: std::time::Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        let key = [5u8; 32];
        let version = StdMutex::new(0i64);
        let value = StdMutex::new(Counter { n: 0 });

        // Run ten sequential updates through the same lock; each should see
        // the previous one's committed version.
        for _ in 0..10 {
            let mut v = *version.lock().unwrap();
            let mut c = value.lock().unwrap().clone();
            update_field(
                &lock,
                &backoff,
                AeadVariant::Legacy,
                &key,
                &mut v,
                &mut c,
                |c| Counter { n: c.n + 1 },
                |v, _ct| async move { Ok(AckOutcome::Success { version: v }) },
            )
            .await
            .unwrap();
            *version.lock().unwrap() = v;
            *value.lock().unwrap() = c;
        }

        assert_eq!(*version.lock().unwrap(), 10);
        assert_eq!(value.lock().unwrap().n, 10);
    }
}
