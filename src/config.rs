// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the status engine.
//!
//! # Example
//!
//! ```
//! use status_engine::StatusEngineConfig;
//!
//! // Minimal config (uses defaults: in-memory cache, 30s fresh / 300s stale)
//! let config = StatusEngineConfig::default();
//! assert_eq!(config.fresh_ttl_secs, 30);
//! assert!(config.validate().is_ok());
//!
//! // Shared Redis cache with a short local layer
//! let config = StatusEngineConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     redis_prefix: Some("status:".into()),
//!     local_cache_ttl_ms: 500,
//!     refresh_interval_secs: 15,
//!     ..Default::default()
//! };
//! assert_eq!(config.hub_config().outbox_capacity, 16);
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::broadcast::HubConfig;
use crate::fetch::{FreshnessPolicy, OrchestratorConfig};
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;
use crate::storage::{TtlPolicy, MAX_TTL};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("stale_ttl_secs ({stale}) must be longer than fresh_ttl_secs ({fresh})")]
    StaleNotLonger { fresh: u64, stale: u64 },
    #[error("near_expiry_secs ({near}) must be shorter than fresh_ttl_secs ({fresh})")]
    NearExpiryTooLong { fresh: u64, near: u64 },
    #[error("{field} must not exceed {max} seconds")]
    TooLong { field: &'static str, max: u64 },
    #[error("retry_initial_delay_ms ({initial}) exceeds retry_max_delay_ms ({max})")]
    RetryDelays { initial: u64, max: u64 },
}

/// Configuration for the status engine.
///
/// All fields have working defaults. Set `redis_url` to share the cache
/// between processes; otherwise an in-memory cache is used.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusEngineConfig {
    // ----- cache backend -----
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix for namespacing a shared Redis instance
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Local read-through layer TTL in front of Redis (0 = disabled)
    #[serde(default = "default_local_cache_ttl_ms")]
    pub local_cache_ttl_ms: u64,

    /// Snapshot file for persistent keys of the in-memory cache
    #[serde(default)]
    pub persist_path: Option<String>,

    /// Key prefixes that are long-lived and persisted
    #[serde(default = "default_persist_prefixes")]
    pub persist_prefixes: Vec<String>,

    /// TTL applied when a write asks for "default" (zero TTL)
    #[serde(default = "default_default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Expired-entry purge interval for the in-memory cache
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    // ----- freshness -----
    #[serde(default = "default_fresh_ttl_secs")]
    pub fresh_ttl_secs: u64,
    #[serde(default = "default_stale_ttl_secs")]
    pub stale_ttl_secs: u64,
    /// Cache hits with less remaining TTL than this trigger a background refresh
    #[serde(default = "default_near_expiry_secs")]
    pub near_expiry_secs: u64,
    /// Longest a caller waits for an upstream result
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_background_refreshes")]
    pub max_background_refreshes: usize,

    // ----- circuit breaker -----
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    // ----- upstream retry -----
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    // ----- broadcast hub -----
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_connection_secs")]
    pub max_connection_secs: u64,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    // ----- scheduler -----
    /// Seconds between refresh cycles (applied live on config update)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Resources fetched concurrently within one cycle
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
}

fn default_local_cache_ttl_ms() -> u64 { 1_000 }
fn default_persist_prefixes() -> Vec<String> { vec!["session:".to_string()] }
fn default_default_ttl_secs() -> u64 { 300 }
fn default_cleanup_interval_secs() -> u64 { 60 }
fn default_fresh_ttl_secs() -> u64 { 30 }
fn default_stale_ttl_secs() -> u64 { 300 } // 10x fresh
fn default_near_expiry_secs() -> u64 { 5 }
fn default_fetch_timeout_secs() -> u64 { 15 }
fn default_max_background_refreshes() -> usize { 8 }
fn default_failure_threshold() -> u32 { 5 }
fn default_failure_window_secs() -> u64 { 60 }
fn default_retry_max_attempts() -> usize { 3 }
fn default_retry_initial_delay_ms() -> u64 { 200 }
fn default_retry_max_delay_ms() -> u64 { 2_000 }
fn default_outbox_capacity() -> usize { 16 }
fn default_send_timeout_ms() -> u64 { 2_000 }
fn default_heartbeat_interval_secs() -> u64 { 25 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_max_connection_secs() -> u64 { 3_600 } // 1 hour
fn default_inactivity_timeout_secs() -> u64 { 300 } // 5 minutes
fn default_refresh_interval_secs() -> u64 { 30 }
fn default_refresh_concurrency() -> usize { 4 }

impl Default for StatusEngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: None,
            local_cache_ttl_ms: default_local_cache_ttl_ms(),
            persist_path: None,
            persist_prefixes: default_persist_prefixes(),
            default_ttl_secs: default_default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            fresh_ttl_secs: default_fresh_ttl_secs(),
            stale_ttl_secs: default_stale_ttl_secs(),
            near_expiry_secs: default_near_expiry_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_background_refreshes: default_max_background_refreshes(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            outbox_capacity: default_outbox_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_connection_secs: default_max_connection_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_concurrency: default_refresh_concurrency(),
        }
    }
}

impl StatusEngineConfig {
    /// Reject values that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 16] = [
            ("default_ttl_secs", self.default_ttl_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("fresh_ttl_secs", self.fresh_ttl_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("max_background_refreshes", self.max_background_refreshes as u64),
            ("failure_threshold", u64::from(self.failure_threshold)),
            ("failure_window_secs", self.failure_window_secs),
            ("retry_max_attempts", self.retry_max_attempts as u64),
            ("outbox_capacity", self.outbox_capacity as u64),
            ("send_timeout_ms", self.send_timeout_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("max_connection_secs", self.max_connection_secs),
            ("inactivity_timeout_secs", self.inactivity_timeout_secs),
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("refresh_concurrency", self.refresh_concurrency as u64),
        ];
        if let Some(&(field, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        let ttls: [(&'static str, u64); 3] = [
            ("default_ttl_secs", self.default_ttl_secs),
            ("fresh_ttl_secs", self.fresh_ttl_secs),
            ("stale_ttl_secs", self.stale_ttl_secs),
        ];
        let max = MAX_TTL.as_secs();
        if let Some(&(field, _)) = ttls.iter().find(|(_, v)| *v > max) {
            return Err(ConfigError::TooLong { field, max });
        }
        if self.stale_ttl_secs <= self.fresh_ttl_secs {
            return Err(ConfigError::StaleNotLonger {
                fresh: self.fresh_ttl_secs,
                stale: self.stale_ttl_secs,
            });
        }
        if self.near_expiry_secs >= self.fresh_ttl_secs {
            return Err(ConfigError::NearExpiryTooLong {
                fresh: self.fresh_ttl_secs,
                near: self.near_expiry_secs,
            });
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::RetryDelays {
                initial: self.retry_initial_delay_ms,
                max: self.retry_max_delay_ms,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            stale_ttl: Duration::from_secs(self.stale_ttl_secs),
            persistent_prefixes: self.persist_prefixes.clone(),
            ..TtlPolicy::default()
        }
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig::new(self.failure_threshold, Duration::from_secs(self.failure_window_secs))
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_attempts: Some(self.retry_max_attempts.max(1)),
            ..RetryConfig::upstream()
        }
    }

    #[must_use]
    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            fresh_ttl: Duration::from_secs(self.fresh_ttl_secs),
            stale_ttl: Duration::from_secs(self.stale_ttl_secs),
            near_expiry: Duration::from_secs(self.near_expiry_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            policy: self.freshness_policy(),
            retry: self.retry_config(),
            max_background_refreshes: self.max_background_refreshes,
        }
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbox_capacity: self.outbox_capacity,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_connection_age: Duration::from_secs(self.max_connection_secs),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
        }
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Local read-through TTL, `None` when the layer is disabled.
    #[must_use]
    pub fn local_cache_ttl(&self) -> Option<Duration> {
        (self.local_cache_ttl_ms > 0).then(|| Duration::from_millis(self.local_cache_ttl_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StatusEngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.freshness_policy(), FreshnessPolicy::default());
        assert_eq!(config.hub_config(), HubConfig::default());
        assert_eq!(config.circuit_config(), CircuitConfig::default());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: StatusEngineConfig = serde_json::from_str(
            r#"{ "redis_url": "redis://cache:6379", "fresh_ttl_secs": 10, "stale_ttl_secs": 100 }"#,
        )
        .unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.fresh_ttl_secs, 10);
        assert_eq!(config.outbox_capacity, 16);
        assert_eq!(config.persist_prefixes, vec!["session:".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_must_outlive_fresh() {
        let config = StatusEngineConfig {
            stale_ttl_secs: 30,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::StaleNotLonger { fresh: 30, stale: 30 })
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = StatusEngineConfig {
            outbox_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { field: "outbox_capacity" }));
    }

    #[test]
    fn test_subscriber_lifetimes_must_be_positive() {
        let config = StatusEngineConfig {
            max_connection_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { field: "max_connection_secs" }));

        let config = StatusEngineConfig {
            inactivity_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { field: "inactivity_timeout_secs" }));
    }

    #[test]
    fn test_unbounded_ttls_rejected() {
        let config = StatusEngineConfig {
            stale_ttl_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooLong { field: "stale_ttl_secs", max: MAX_TTL.as_secs() })
        );
    }

    #[test]
    fn test_near_expiry_and_retry_bounds() {
        let config = StatusEngineConfig {
            near_expiry_secs: 30,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NearExpiryTooLong { .. })));

        let config = StatusEngineConfig {
            retry_initial_delay_ms: 5_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::RetryDelays { .. })));
    }

    #[test]
    fn test_local_layer_toggle() {
        let mut config = StatusEngineConfig::default();
        assert_eq!(config.local_cache_ttl(), Some(Duration::from_secs(1)));
        config.local_cache_ttl_ms = 0;
        assert_eq!(config.local_cache_ttl(), None);
    }
}
