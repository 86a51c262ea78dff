// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the fetch orchestrator.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::resilience::retry::RetryConfig;

/// Type-erased upstream error as returned by fetch functions.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Errors surfaced by [`super::FetchOrchestrator::fetch_with_cache`].
///
/// Cache backend failures never appear here: they are treated as misses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Circuit open (or upstream failing) and no stale entry to fall back to
    #[error("'{key}' is unavailable: circuit open and no stale data")]
    Unavailable { key: String },

    /// The fetch function kept failing until the retry budget ran out
    #[error("upstream fetch for '{key}' failed after {attempts} attempt(s): {cause}")]
    UpstreamFailed {
        key: String,
        attempts: usize,
        cause: Arc<dyn Error + Send + Sync + 'static>,
    },

    /// The caller's token was cancelled
    #[error("fetch cancelled")]
    Cancelled,

    /// The caller's wait budget ran out with no stale entry to fall back to
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),

    /// The orchestrator has been closed
    #[error("orchestrator is closed")]
    Closed,

    #[error("failed to encode fetched value: {0}")]
    Encode(String),

    #[error("failed to decode cached value: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// The original upstream error, for callers that branch on its type.
    #[must_use]
    pub fn upstream_cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::UpstreamFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::UpstreamFailed { .. } => "upstream_failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut(_) => "timed_out",
            Self::Closed => "closed",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::Internal(_) => "internal",
        }
    }
}

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Fresh cache entry
    Cache,
    /// Just fetched from the upstream
    Upstream,
    /// Long-lived fallback entry, served because the upstream is unhealthy
    Stale,
}

impl FetchSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Upstream => "upstream",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for FetchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value labelled with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub source: FetchSource,
}

impl<T> Fetched<T> {
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.source == FetchSource::Stale
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Fresh/stale TTLs and timing budget shared by every call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// TTL of the primary entry
    pub fresh_ttl: Duration,
    /// TTL of the `:stale` fallback entry, well above `fresh_ttl`
    pub stale_ttl: Duration,
    /// Cache hits with less remaining TTL than this trigger a background refresh
    pub near_expiry: Duration,
    /// Longest a caller waits for an upstream result
    pub fetch_timeout: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            fresh_ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(300),
            near_expiry: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

/// Construction options for [`super::FetchOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub policy: FreshnessPolicy,
    pub retry: RetryConfig,
    /// Concurrent background refreshes allowed per orchestrator
    pub max_background_refreshes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: FreshnessPolicy::default(),
            retry: RetryConfig::upstream(),
            max_background_refreshes: 8,
        }
    }
}
