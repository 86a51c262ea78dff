// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache storage backends.
//!
//! - [`memory::InMemoryStore`]: process-local map, optionally persisting
//!   long-lived keys to disk through [`persist::DiskSnapshot`]
//! - [`redis::RedisStore`]: networked store guarded by its own breaker
//! - [`local::ReadThroughStore`]: short-lived local layer in front of any store
//!
//! Every entry carries a deadline. A zero TTL is resolved through
//! [`TtlPolicy`] so nothing is ever kept forever.

pub mod traits;
pub mod memory;
pub mod persist;
pub mod local;
pub mod redis;

use std::time::Duration;

pub use traits::{deadline_after, CacheEntry, CacheStore, StorageError, MAX_TTL};

/// Suffix of the long-lived fallback entry kept next to each fresh entry.
pub const STALE_SUFFIX: &str = ":stale";

/// Key of the stale shadow entry for `key`.
#[must_use]
pub fn stale_key(key: &str) -> String {
    format!("{key}{STALE_SUFFIX}")
}

/// Resolves a zero TTL to a default that depends on the kind of key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    /// TTL for ordinary keys
    pub default_ttl: Duration,
    /// TTL for `:stale` shadow entries
    pub stale_ttl: Duration,
    /// TTL for keys under a persistent prefix (sessions and the like)
    pub persistent_ttl: Duration,
    /// Key prefixes treated as long-lived
    pub persistent_prefixes: Vec<String>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            stale_ttl: Duration::from_secs(300),
            persistent_ttl: Duration::from_secs(7 * 24 * 3600),
            persistent_prefixes: vec!["session:".to_string()],
        }
    }
}

impl TtlPolicy {
    #[must_use]
    pub fn is_persistent(&self, key: &str) -> bool {
        self.persistent_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Return `ttl` unchanged unless it is zero. Never exceeds [`MAX_TTL`].
    #[must_use]
    pub fn resolve(&self, key: &str, ttl: Duration) -> Duration {
        if !ttl.is_zero() {
            return ttl.min(MAX_TTL);
        }
        if key.ends_with(STALE_SUFFIX) {
            self.stale_ttl
        } else if self.is_persistent(key) {
            self.persistent_ttl
        } else {
            self.default_ttl
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_key() {
        assert_eq!(stale_key("radarr:queue"), "radarr:queue:stale");
    }

    #[test]
    fn test_zero_ttl_resolves_by_key_kind() {
        let policy = TtlPolicy {
            default_ttl: Duration::from_secs(60),
            stale_ttl: Duration::from_secs(600),
            persistent_ttl: Duration::from_secs(3600),
            persistent_prefixes: vec!["session:".into()],
        };

        assert_eq!(policy.resolve("plex:sessions", Duration::ZERO), Duration::from_secs(60));
        assert_eq!(policy.resolve("plex:sessions:stale", Duration::ZERO), Duration::from_secs(600));
        assert_eq!(policy.resolve("session:abc", Duration::ZERO), Duration::from_secs(3600));
    }

    #[test]
    fn test_explicit_ttl_is_kept() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.resolve("session:abc", Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(policy.resolve("plex:sessions", Duration::MAX), MAX_TTL);
    }
}
