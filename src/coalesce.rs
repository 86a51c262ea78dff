// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request coalescing (singleflight).
//!
//! Concurrent calls sharing a key collapse into one execution. The first
//! caller (the leader) spawns the work as its own task and every caller,
//! leader included, waits on a `watch` channel for the result:
//!
//! ```text
//! caller A ──┐
//! caller B ──┼──▶ inflight["radarr:queue"] ──▶ spawned task ──▶ watch::Sender
//! caller C ──┘         (one entry per key)         (runs once)        │
//!     ▲                                                               │
//!     └──────────────── same Result cloned to every waiter ◀──────────┘
//! ```
//!
//! Because the work runs in its own task, a caller that stops waiting does
//! not cancel it: the remaining waiters still get the result. The map entry
//! is removed (by an RAII guard) before the result is published, so a caller
//! arriving afterwards starts a fresh execution and nothing about past keys
//! is retained.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

type ResultSlot<V, E> = watch::Receiver<Option<Result<V, E>>>;

struct Inflight<V, E> {
    id: u64,
    rx: ResultSlot<V, E>,
}

/// Error returned to waiters of a coalesced call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoalesceError<E> {
    /// The shared execution returned an error
    #[error("{0}")]
    Inner(E),
    /// The shared execution ended without producing a result (it panicked or
    /// the runtime is shutting down)
    #[error("shared call aborted before completing")]
    Aborted,
}

/// Outcome of [`Coalescer::run`].
#[derive(Debug, Clone)]
pub struct Coalesced<V, E> {
    pub result: Result<V, CoalesceError<E>>,
    /// `true` if this caller joined an execution started by someone else
    pub shared: bool,
}

/// Removes the in-flight entry when the executing task finishes or unwinds.
struct RemoveOnDrop<V, E> {
    inflight: Arc<DashMap<String, Inflight<V, E>>>,
    key: String,
    id: u64,
}

impl<V, E> Drop for RemoveOnDrop<V, E> {
    fn drop(&mut self) {
        self.inflight.remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

/// Deduplicates concurrent executions per key.
pub struct Coalescer<V, E> {
    inflight: Arc<DashMap<String, Inflight<V, E>>>,
    next_id: Arc<AtomicU64>,
}

impl<V, E> Clone for Coalescer<V, E> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<V, E> Default for Coalescer<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> Coalescer<V, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether an execution for `key` is currently running.
    #[must_use]
    pub fn in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Number of keys with a running execution.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

impl<V, E> Coalescer<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Run `f` for `key` unless an execution is already in flight, in which
    /// case wait for that one instead. `f` is only invoked by the leader.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Coalesced<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (mut rx, leader) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().rx.clone(), None),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entry.insert(Inflight { id, rx: rx.clone() });
                (rx, Some((tx, id)))
            }
        };

        let shared = leader.is_none();
        if let Some((tx, id)) = leader {
            let guard = RemoveOnDrop {
                inflight: Arc::clone(&self.inflight),
                key: key.to_string(),
                id,
            };
            let fut = f();
            tokio::spawn(async move {
                let result = fut.await;
                drop(guard);
                let _ = tx.send(Some(result));
            });
        } else {
            debug!(key, "Joined in-flight call");
            crate::metrics::record_coalesced();
        }

        let result = match rx.wait_for(Option::is_some).await {
            Ok(slot) => match slot.as_ref() {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(e)) => Err(CoalesceError::Inner(e.clone())),
                None => Err(CoalesceError::Aborted),
            },
            Err(_) => {
                warn!(key, "Coalesced call ended without a result");
                Err(CoalesceError::Aborted)
            }
        };

        Coalesced { result, shared }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_caller_runs_once() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let out = coalescer.run("k", || async { Ok(7) }).await;

        assert_eq!(out.result, Ok(7));
        assert!(!out.shared);
        assert!(coalescer.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_execution() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("shared", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(99)
                    })
                    .await
            }));
        }

        let mut shared = 0;
        for handle in handles {
            let out = handle.await.unwrap();
            assert_eq!(out.result, Ok(99));
            if out.shared {
                shared += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 9);
        assert!(!coalescer.in_flight("shared"));
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let a = coalescer.run("k", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err("boom".to_string())
        });
        let b = coalescer.run("k", || async { Ok(1) });

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.result, Err(CoalesceError::Inner("boom".to_string())));
        assert_eq!(b.result, Err(CoalesceError::Inner("boom".to_string())));
        assert!(b.shared);
    }

    #[tokio::test]
    async fn test_key_is_free_after_completion() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
            let out = coalescer.run("k", move || async move { Ok(n) }).await;
            assert!(!out.shared);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let coalescer: Coalescer<&'static str, String> = Coalescer::new();
        let a = coalescer.run("a", || async { Ok("a") });
        let b = coalescer.run("b", || async { Ok("b") });
        let (a, b) = tokio::join!(a, b);

        assert!(!a.shared && !b.shared);
        assert_eq!(a.result, Ok("a"));
        assert_eq!(b.result, Ok("b"));
    }

    #[tokio::test]
    async fn test_abandoned_leader_does_not_cancel_work() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let leader = {
            let coalescer = coalescer.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                coalescer
                    .run("k", move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(5)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let follower = coalescer.run("k", || async { Ok(0) }).await;
        assert!(follower.shared);
        assert_eq!(follower.result, Ok(5));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_execution_aborts_waiters_and_frees_key() {
        let coalescer: Coalescer<u32, String> = Coalescer::new();
        let out = coalescer
            .run("k", || async {
                if true {
                    panic!("upstream handler bug");
                }
                Ok(1)
            })
            .await;

        assert_eq!(out.result, Err(CoalesceError::Aborted));
        assert!(!coalescer.in_flight("k"));
    }
}
