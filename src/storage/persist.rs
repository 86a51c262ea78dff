// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Disk snapshot of long-lived cache entries.
//!
//! Keys under a persistent prefix (sessions) survive a restart of the memory
//! backend. The snapshot is a single JSON array:
//!
//! ```json
//! [
//!   {"key": "session:abc", "payload_hex": "7b7d", "expires_at_ms": 1767084657058}
//! ]
//! ```
//!
//! Deadlines are stored as unix milliseconds and converted back to monotonic
//! deadlines on load. Records already expired at load time are skipped.
//! Writes go to a sibling temp file which is then renamed over the snapshot.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{deadline_after, CacheEntry, StorageError};

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: String,
    pub payload_hex: String,
    pub expires_at_ms: u64,
}

impl PersistedRecord {
    #[must_use]
    pub fn from_entry(entry: &CacheEntry, now_ms: u64) -> Self {
        let remaining = entry.remaining_ttl().as_millis() as u64;
        Self {
            key: entry.key.clone(),
            payload_hex: hex::encode(&entry.payload),
            expires_at_ms: now_ms.saturating_add(remaining),
        }
    }

    /// Convert back to a live entry, or `None` if expired or malformed.
    #[must_use]
    pub fn into_entry(self, now_ms: u64) -> Option<CacheEntry> {
        if self.expires_at_ms <= now_ms {
            return None;
        }
        let payload = hex::decode(&self.payload_hex).ok()?;
        Some(CacheEntry {
            key: self.key,
            payload,
            expires_at: deadline_after(Duration::from_millis(self.expires_at_ms - now_ms)),
        })
    }
}

/// Parse a snapshot file body.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<PersistedRecord>, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Atomic JSON snapshot on disk.
pub struct DiskSnapshot {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load live entries. A missing file yields an empty set.
    pub async fn load(&self) -> Result<Vec<CacheEntry>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Backend(format!(
                "Failed to read snapshot {}: {}", self.path.display(), e
            ))),
        };

        let now_ms = unix_now_ms();
        let records = decode_records(&bytes)?;
        let total = records.len();
        let entries: Vec<CacheEntry> = records
            .into_iter()
            .filter_map(|r| r.into_entry(now_ms))
            .collect();

        debug!(path = %self.path.display(), loaded = entries.len(), skipped = total - entries.len(), "Loaded cache snapshot");
        Ok(entries)
    }

    /// Replace the snapshot with `entries`.
    pub async fn save(&self, entries: &[CacheEntry]) -> Result<(), StorageError> {
        self.save_with(|| entries.to_vec()).await
    }

    /// Replace the snapshot with whatever `collect` returns.
    ///
    /// `collect` runs while the write lock is held, so concurrent savers
    /// land on disk in the order they observed the data.
    pub async fn save_with<F>(&self, collect: F) -> Result<(), StorageError>
    where
        F: FnOnce() -> Vec<CacheEntry>,
    {
        let _guard = self.write_lock.lock().await;
        let entries = collect();

        let now_ms = unix_now_ms();
        let records: Vec<PersistedRecord> = entries
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| PersistedRecord::from_entry(e, now_ms))
            .collect();
        let body = serde_json::to_vec(&records)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StorageError::Backend(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        tokio::fs::write(&tmp, &body).await.map_err(|e| {
            StorageError::Backend(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), error = %e, "Snapshot rename failed");
            return Err(StorageError::Backend(e.to_string()));
        }

        debug!(path = %self.path.display(), records = records.len(), "Saved cache snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let snapshot = DiskSnapshot::new(dir.path().join("cache.json"));

        let entries = vec![
            CacheEntry::new("session:a", b"alpha".to_vec(), Duration::from_secs(600)),
            CacheEntry::new("session:b", b"beta".to_vec(), Duration::from_secs(600)),
        ];
        snapshot.save(&entries).await.unwrap();

        let mut loaded = snapshot.load().await.unwrap();
        loaded.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].key, "session:a");
        assert_eq!(loaded[0].payload, b"alpha");
        assert!(loaded[1].remaining_ttl() > Duration::from_secs(590));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let snapshot = DiskSnapshot::new(dir.path().join("nope.json"));
        assert!(snapshot.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_file_is_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = DiskSnapshot::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn test_expired_record_is_skipped() {
        let record = PersistedRecord {
            key: "session:old".into(),
            payload_hex: "00".into(),
            expires_at_ms: 1_000,
        };
        assert!(record.into_entry(2_000).is_none());
    }

    #[test]
    fn test_bad_hex_is_skipped() {
        let record = PersistedRecord {
            key: "session:bad".into(),
            payload_hex: "zz".into(),
            expires_at_ms: 10_000,
        };
        assert!(record.into_entry(1_000).is_none());
    }
}
