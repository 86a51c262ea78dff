// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Status Engine
//!
//! A resilient fetch-cache-broadcast pipeline for dashboards that watch many
//! flaky upstream services.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Refresh Scheduler                       │
//! │  • Fixed-interval pass over monitored resources            │
//! │  • Bounded concurrency against upstreams                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Fetch Orchestrator                       │
//! │  • Fresh cache → breaker → coalesced, retried upstream     │
//! │  • Stale fallback when the upstream is unhealthy           │
//! │  • Background refresh of entries close to expiry           │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                            │
//!                 ▼                            ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │         Cache Store          │  │  Circuit Breaker / kind  │
//! │  • Memory (+ disk snapshot)  │  │  • Closed/Open/HalfOpen  │
//! │  • Redis behind local layer  │  │  • Failure window        │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                              │
//!                 (Change detection on each result)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Broadcast Hub                          │
//! │  • Bounded outbox per subscriber, never blocks publishers  │
//! │  • Heartbeats, age and inactivity sweep                    │
//! │  • SSE framing                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use status_engine::{MonitoredResource, ServiceKind, StatusEngine, StatusEngineConfig};
//! use status_engine::scheduler::source_fn;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StatusEngineConfig::default();
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let engine = Arc::new(StatusEngine::connect(config, rx).await.expect("Failed to connect"));
//!
//!     // Poll a resource every refresh interval
//!     engine.monitor(MonitoredResource::new(
//!         "radarr:queue",
//!         ServiceKind::Radarr,
//!         source_fn(|_token| async { Ok(json!({"records": []})) }),
//!     ));
//!
//!     // Receive change events
//!     let mut events = engine.register().expect("hub closed");
//!     let runner = tokio::spawn({
//!         let engine = engine.clone();
//!         async move { engine.run().await }
//!     });
//!
//!     if let Some(event) = events.recv().await {
//!         println!("{} is {}", event.subject_id, event.kind);
//!     }
//!
//!     engine.shutdown().await.expect("shutdown");
//!     runner.await.expect("run loop").expect("run");
//! }
//! ```
//!
//! ## Features
//!
//! - **Stale-While-Revalidate**: fresh and long-lived stale entries per key
//! - **Request Coalescing**: at most one upstream call per key at a time
//! - **Circuit Breakers**: one per service kind, sliding failure window
//! - **Retry Logic**: cancellable exponential backoff with presets
//! - **Change Detection**: canonical fingerprints suppress no-op broadcasts
//! - **Non-blocking Fan-out**: a stalled subscriber only loses its own events
//!
//! ## Configuration
//!
//! See [`StatusEngineConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`StatusEngine`] wiring all components
//! - [`storage`]: Cache backends (Memory, Redis, read-through layer)
//! - [`resilience`]: Circuit breakers and retry logic
//! - [`coalesce`]: Per-key call deduplication
//! - [`fetch`]: The stale-while-revalidate orchestrator
//! - [`change`]: Fingerprints and change classification
//! - [`broadcast`]: Subscriber hub and SSE framing
//! - [`scheduler`]: Periodic refresh driver
//! - [`services`]: Known service kinds and per-kind registries

pub mod config;
pub mod storage;
pub mod resilience;
pub mod coalesce;
pub mod fetch;
pub mod change;
pub mod broadcast;
pub mod scheduler;
pub mod services;
pub mod coordinator;
pub mod metrics;

pub use config::{ConfigError, StatusEngineConfig};
pub use coordinator::{EngineError, EngineState, HealthCheck, StatusEngine};
pub use storage::{CacheEntry, CacheStore, StorageError, TtlPolicy};
pub use storage::memory::InMemoryStore;
pub use storage::local::ReadThroughStore;
pub use storage::redis::RedisStore;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::{retry, RetryConfig, RetryError};
pub use coalesce::{CoalesceError, Coalesced, Coalescer};
pub use fetch::{BoxError, FetchError, FetchOrchestrator, FetchSource, Fetched, FreshnessPolicy, OrchestratorConfig};
pub use change::{classify, fingerprint, Change, ChangeDetector, ChangeKind, Fingerprint};
pub use broadcast::{BroadcastHub, Event, EvictReason, HubConfig, HubError, HubStats, PublishReport, SubscriberId, SubscriberState, Subscription};
pub use scheduler::{CycleReport, MonitoredResource, PublishPolicy, RefreshScheduler, StatusSource};
pub use services::{BreakerRegistry, OrchestratorRegistry, ServiceKind, UnknownServiceKind};
