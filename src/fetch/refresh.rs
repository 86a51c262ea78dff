// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded pool for background refreshes.
//!
//! A cache hit close to expiry asks the pool to refresh the key. The pool
//! never queues: if every permit is taken the refresh is skipped and the next
//! near-expiry hit (or the periodic scheduler) tries again. Tasks are tracked
//! so [`RefreshPool::close`] can cancel and await them.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

pub struct RefreshPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl RefreshPool {
    pub fn new(max_concurrent: usize, token: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            token,
        }
    }

    /// Run `task` in the background if a permit is free. Returns whether it
    /// was started.
    pub fn spawn<Fut>(&self, key: &str, task: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() || self.tracker.is_closed() {
            return false;
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            debug!(key, "Background refresh skipped, pool saturated");
            crate::metrics::record_background_refresh("skipped");
            return false;
        };

        let token = self.token.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
        true
    }

    /// Refreshes currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel running refreshes and wait for them to finish.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_saturated_pool_skips() {
        let pool = RefreshPool::new(1, CancellationToken::new());
        assert!(pool.spawn("a", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }));
        assert!(!pool.spawn("b", async {}));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_running_tasks() {
        let pool = RefreshPool::new(4, CancellationToken::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        pool.spawn("slow", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::timeout(Duration::from_secs(1), pool.close()).await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(pool.active(), 0);
        assert!(!pool.spawn("late", async {}));
    }
}
