//! `AsyncLock` (§4.9): cooperative single-holder mutex used to serialize
//! C5 writes per field (metadata, agent-state).
//!
//! `tokio::sync::Mutex` already provides FIFO wakeup order for waiters, so
//! this is a thin, purpose-named wrapper rather than a hand-rolled queue.
//! No reentrancy: a holder that calls `acquire` again from within its own
//! closure deadlocks, matching the source's documented behavior.

use tokio::sync::Mutex;

#[derive(Default)]
pub struct AsyncLock {
    inner: Mutex<()>,
}

impl AsyncLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    /// Run `body` while holding the lock. Callers must not call `acquire`
    /// again from within `body` on the same lock.
    pub async fn acquire<T, F, Fut>(&self, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _guard = self.inner.lock().await;
        body().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn serializes_concurrent_holders() {
        let lock = Arc::new(AsyncLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire(|| async {
                    let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(inside, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_body_value() {
        let lock = AsyncLock::new();
        let value = lock.acquire(|| async { 7 }).await;
        assert_eq!(value, 7);
    }
}
