// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    /// The backend could not be reached (connection refused, timeout, circuit open).
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Store is closed")]
    Closed,
}

impl StorageError {
    /// True for outcomes the orchestrator treats as a plain cache miss.
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotFound | Self::Unavailable(_))
    }
}

/// Longest lifetime an entry can have. Larger TTLs are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Deadline `ttl` from now, clamped to [`MAX_TTL`] so it never overflows.
#[must_use]
pub fn deadline_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

/// A cached value together with its absolute deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            payload,
            expires_at: deadline_after(ttl),
        }
    }

    /// Time left before the entry expires (zero once expired).
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Key/value store with per-entry TTL.
///
/// A `ttl` of zero means "use the backend's type-appropriate default", never
/// "keep forever". `get` returns `Ok(None)` on a miss; backends report an
/// unreachable remote as [`StorageError::Unavailable`] rather than panicking.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;
    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Release background resources. A second call returns [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;

    /// Short backend name used in logs and metric labels.
    fn name(&self) -> &'static str;
}
