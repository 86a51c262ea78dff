// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::persist::DiskSnapshot;
use super::traits::{CacheEntry, CacheStore, StorageError};
use super::TtlPolicy;

/// Process-local cache backed by a `DashMap`.
///
/// Expired entries are invisible to `get` and removed lazily; call
/// [`InMemoryStore::spawn_cleanup`] to purge them periodically as well.
pub struct InMemoryStore {
    data: DashMap<String, CacheEntry>,
    ttl: TtlPolicy,
    snapshot: Option<DiskSnapshot>,
    closed: AtomicBool,
    cleanup: CancellationToken,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(TtlPolicy::default())
    }

    #[must_use]
    pub fn with_policy(ttl: TtlPolicy) -> Self {
        Self {
            data: DashMap::new(),
            ttl,
            snapshot: None,
            closed: AtomicBool::new(false),
            cleanup: CancellationToken::new(),
        }
    }

    /// Create a store that snapshots persistent-prefix keys to `path` and
    /// restores whatever is still live from a previous run.
    pub async fn with_persistence(ttl: TtlPolicy, path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let snapshot = DiskSnapshot::new(path);
        let restored = match snapshot.load().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %snapshot.path().display(), error = %e, "Ignoring unreadable cache snapshot");
                Vec::new()
            }
        };

        let store = Self {
            snapshot: Some(snapshot),
            ..Self::with_policy(ttl)
        };
        let count = restored.len();
        for entry in restored {
            if store.ttl.is_persistent(&entry.key) {
                store.data.insert(entry.key.clone(), entry);
            }
        }
        if count > 0 {
            info!(restored = count, "Restored persistent cache entries");
        }
        Ok(store)
    }

    /// Get current entry count (including not-yet-purged expired entries)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.data.clear();
    }

    #[must_use]
    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired());
        let purged = before.saturating_sub(self.data.len());
        if purged > 0 {
            crate::metrics::record_cache_purged(purged);
        }
        purged
    }

    /// Start a background task purging expired entries every `interval`.
    ///
    /// The task holds only a weak reference and stops on [`CacheStore::close`]
    /// or when the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.cleanup.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else { break };
                        let purged = store.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        snapshot
            .save_with(|| {
                self.data
                    .iter()
                    .filter(|e| self.ttl.is_persistent(e.key()))
                    .map(|e| e.value().clone())
                    .collect()
            })
            .await
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.ensure_open()?;
        let entry = self.data.get(key).map(|r| r.value().clone());
        match entry {
            Some(entry) if entry.is_expired() => {
                self.data.remove_if(key, |_, e| e.is_expired());
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        let ttl = self.ttl.resolve(key, ttl);
        self.data.insert(key.to_string(), CacheEntry::new(key, payload, ttl));
        if self.ttl.is_persistent(key) {
            self.persist().await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let removed = self.data.remove(key).is_some();
        if removed && self.ttl.is_persistent(key) {
            self.persist().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::Closed);
        }
        self.cleanup.cancel();
        self.purge_expired();
        self.persist().await
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
