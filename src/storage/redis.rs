// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis cache backend.
//!
//! Entries are plain Redis strings written with `SET key value PX ttl_ms`;
//! reads pipeline `GET` and `PTTL` so the returned [`CacheEntry`] carries the
//! server-side deadline:
//!
//! ```text
//! SET  <prefix><key> <payload> PX <ttl_ms>
//! GET  <prefix><key>  +  PTTL <prefix><key>
//! DEL  <prefix><key>
//! ```
//!
//! Connection-class failures are retried with [`RetryConfig::query`] under
//! the store's own cancellation token; command errors (wrong type, syntax)
//! fail on the first attempt. Every command is guarded by a dedicated
//! circuit breaker. Connection
//! class failures (refused, dropped, timed out) count against the breaker and
//! surface as [`StorageError::Unavailable`], which callers treat as a miss.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::traits::{deadline_after, CacheEntry, CacheStore, StorageError};
use super::TtlPolicy;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::resilience::retry::{retry, retry_if, RetryConfig, RetryError};

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "status:" → "status:radarr:queue")
    prefix: String,
    ttl: TtlPolicy,
    breaker: CircuitBreaker,
    token: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use status_engine::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "status:radarr:queue"
    /// let store = RedisStore::with_prefix("redis://localhost", Some("status:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        Self::connect(connection_string, prefix, TtlPolicy::default(), CancellationToken::new()).await
    }

    /// Connect with full control over TTL defaults and cancellation.
    ///
    /// The connection attempt is retried with [`RetryConfig::startup`] and
    /// stops early when `token` is cancelled. Cancelling `token` later also
    /// aborts in-flight command retries.
    pub async fn connect(
        connection_string: &str,
        prefix: Option<&str>,
        ttl: TtlPolicy,
        token: CancellationToken,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry(&token, "redis_connect", &RetryConfig::startup(), || {
            ConnectionManager::new(client.clone())
        })
        .await
        .map_err(|e: RetryError<RedisError>| match e {
            RetryError::Cancelled { .. } => StorageError::Unavailable("connect cancelled".to_string()),
            RetryError::Exhausted { last, .. } => classify(&last),
        })?;

        info!(prefix = prefix.unwrap_or(""), "Connected to Redis");
        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            ttl,
            breaker: CircuitBreaker::new("redis", CircuitConfig::default()),
            token,
            closed: AtomicBool::new(false),
        })
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Breaker guarding this backend.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run one command through the breaker and the retry loop.
    async fn guarded<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        self.ensure_open()?;
        if self.breaker.is_open() {
            self.breaker.note_rejection();
            return Err(StorageError::Unavailable("redis circuit open".to_string()));
        }

        match retry_if(&self.token, operation, &RetryConfig::query(), command, is_transient).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(RetryError::Cancelled { .. }) => Err(StorageError::Closed),
            Err(RetryError::Exhausted { last, attempts }) => {
                let err = classify(&last);
                if matches!(err, StorageError::Unavailable(_)) {
                    self.breaker.record_failure();
                    crate::metrics::record_connection_error("redis");
                }
                warn!(operation, attempts, error = %last, "Redis command failed");
                Err(err)
            }
        }
    }
}

#[inline]
fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{key}")
    }
}

/// Connection-class failures mean "backend unreachable"; anything else is a
/// command or data problem.
fn classify(err: &RedisError) -> StorageError {
    let unreachable = err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
        || err.is_io_error()
        || matches!(err.kind(), ErrorKind::IoError);
    if unreachable {
        StorageError::Unavailable(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

/// Only an unreachable backend is worth another attempt.
fn is_transient(err: &RedisError) -> bool {
    matches!(classify(err), StorageError::Unavailable(_))
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let full_key = prefixed(&self.prefix, key);

        let (payload, pttl): (Option<Vec<u8>>, i64) = self
            .guarded("redis_get", || {
                let mut conn = self.connection.clone();
                let full_key = full_key.clone();
                async move {
                    redis::pipe()
                        .cmd("GET")
                        .arg(&full_key)
                        .cmd("PTTL")
                        .arg(&full_key)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        // -2: gone between GET and PTTL; -1: no expiry set by someone else.
        let remaining = match pttl {
            -2 => return Ok(None),
            ms if ms < 0 => self.ttl.resolve(key, Duration::ZERO),
            ms => Duration::from_millis(ms as u64),
        };

        Ok(Some(CacheEntry {
            key: key.to_string(),
            payload,
            expires_at: deadline_after(remaining),
        }))
    }

    async fn set(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        let full_key = prefixed(&self.prefix, key);
        let ttl_ms = self.ttl.resolve(key, ttl).as_millis().max(1) as u64;

        self.guarded("redis_set", || {
            let mut conn = self.connection.clone();
            let full_key = full_key.clone();
            let payload = payload.clone();
            async move {
                let _: () = redis::cmd("SET")
                    .arg(&full_key)
                    .arg(payload)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full_key = prefixed(&self.prefix, key);

        self.guarded("redis_delete", || {
            let mut conn = self.connection.clone();
            let full_key = full_key.clone();
            async move {
                let _: () = conn.del(&full_key).await?;
                Ok(())
            }
        })
        .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StorageError::Closed);
        }
        self.token.cancel();
        info!("Redis store closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
