// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local read-through layer.
//!
//! Hot keys are served from a process-local map for at most `local_ttl`
//! before the remote store is consulted again. A local copy never outlives
//! the remote entry it was read from:
//!
//! ```text
//! local deadline = min(remote expires_at, read time + local_ttl)
//! ```
//!
//! Writes and deletes go to the remote first and then update or drop the
//! local copy, so this process always reads its own writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{deadline_after, CacheEntry, CacheStore, StorageError};

struct LocalEntry {
    entry: CacheEntry,
    deadline: Instant,
}

pub struct ReadThroughStore<S> {
    remote: S,
    local: DashMap<String, LocalEntry>,
    local_ttl: Duration,
    closed: AtomicBool,
}

impl<S: CacheStore> ReadThroughStore<S> {
    pub fn new(remote: S, local_ttl: Duration) -> Self {
        Self {
            remote,
            local: DashMap::new(),
            local_ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// The store behind the local layer.
    pub fn remote(&self) -> &S {
        &self.remote
    }

    #[must_use]
    pub fn local_ttl(&self) -> Duration {
        self.local_ttl
    }

    /// Entries currently held locally (expired ones included until touched).
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    fn remember(&self, entry: CacheEntry) {
        let deadline = entry.expires_at.min(deadline_after(self.local_ttl));
        self.local.insert(entry.key.clone(), LocalEntry { entry, deadline });
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for ReadThroughStore<S> {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.ensure_open()?;

        if let Some(local) = self.local.get(key) {
            if Instant::now() < local.deadline {
                return Ok(Some(local.entry.clone()));
            }
        }
        self.local.remove_if(key, |_, l| Instant::now() >= l.deadline);

        let fetched = self.remote.get(key).await?;
        match fetched {
            Some(entry) if !entry.is_expired() => {
                self.remember(entry.clone());
                Ok(Some(entry))
            }
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        // Drop the local copy first: if the remote write fails we must not
        // keep serving a value the remote no longer agrees with.
        self.local.remove(key);
        self.remote.set(key, payload.clone(), ttl).await?;

        // A zero TTL is resolved by the remote; its deadline is unknown here,
        // so the next read fetches it.
        if !ttl.is_zero() {
            self.remember(CacheEntry::new(key, payload, ttl));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.local.remove(key);
        self.remote.delete(key).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::Closed);
        }
        let dropped = self.local.len();
        self.local.clear();
        debug!(dropped, remote = self.remote.name(), "Closing read-through store");
        self.remote.close().await
    }

    fn name(&self) -> &'static str {
        "read_through"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;

    fn store(local_ttl: Duration) -> ReadThroughStore<InMemoryStore> {
        ReadThroughStore::new(InMemoryStore::new(), local_ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_copy_served_until_local_ttl() {
        let store = store(Duration::from_secs(1));
        store.set("k", b"v1".to_vec(), Duration::from_secs(60)).await.unwrap();

        // Another process overwrites the remote.
        store.remote().set("k", b"v2".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().payload, b"v1");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap().unwrap().payload, b"v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_copy_never_outlives_remote() {
        let store = store(Duration::from_secs(10));
        store.remote().set("k", b"v".to_vec(), Duration::from_millis(500)).await.unwrap();

        assert!(store.get("k").await.unwrap().is_some());
        assert_eq!(store.local_len(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.local_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_ttl_is_the_remote_one() {
        let store = store(Duration::from_secs(1));
        store.set("k", b"v".to_vec(), Duration::from_secs(30)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.remaining_ttl(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_delete_drops_local_copy() {
        let store = store(Duration::from_secs(60));
        store.set("k", b"v".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.delete("k").await.unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.remote().get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_closes_remote() {
        let store = store(Duration::from_secs(1));
        store.close().await.unwrap();
        assert_eq!(store.close().await.unwrap_err(), StorageError::Closed);
        assert_eq!(store.remote().get("k").await.unwrap_err(), StorageError::Closed);
        assert_eq!(store.get("k").await.unwrap_err(), StorageError::Closed);
    }
}
