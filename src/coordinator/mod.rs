// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Status engine coordinator.
//!
//! The [`StatusEngine`] ties together all components:
//! - Cache backend (in-memory, optionally persistent, or Redis behind a local layer)
//! - One circuit breaker and one fetch orchestrator per service kind
//! - Change detector
//! - Broadcast hub with heartbeat and sweep
//! - Refresh scheduler
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use status_engine::{EngineState, StatusEngine, StatusEngineConfig};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StatusEngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let engine = StatusEngine::connect(config, rx).await?;
//! assert_eq!(engine.state(), EngineState::Ready);
//!
//! let _events = engine.register()?;
//! // tokio::spawn(async move { engine.run().await });
//! # Ok(())
//! # }
//! ```

mod types;
mod lifecycle;

pub use types::{EngineError, EngineState, HealthCheck};

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broadcast::{BroadcastHub, HubError, Subscription};
use crate::change::ChangeDetector;
use crate::config::StatusEngineConfig;
use crate::fetch::{BoxError, FetchError, FetchOrchestrator, Fetched};
use crate::scheduler::{CycleReport, MonitoredResource, RefreshScheduler};
use crate::services::{BreakerRegistry, OrchestratorRegistry, ServiceKind};
use crate::storage::CacheStore;

/// Main status engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc` and call
/// [`run()`](Self::run) on one task while request handlers fetch and register.
pub struct StatusEngine {
    /// Configuration (updated at runtime via watch channel)
    pub(super) config: RwLock<StatusEngineConfig>,

    /// Runtime config updates, consumed by the run loop
    pub(super) config_rx: Mutex<watch::Receiver<StatusEngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) cache: Arc<dyn CacheStore>,
    pub(super) breakers: BreakerRegistry,
    pub(super) orchestrators: OrchestratorRegistry,
    pub(super) detector: Arc<ChangeDetector>,
    pub(super) hub: BroadcastHub,
    pub(super) scheduler: Arc<RefreshScheduler>,

    /// Cancelled by [`shutdown()`](Self::shutdown); parent of every task token
    pub(super) shutdown: CancellationToken,
    /// Background tasks owned by the engine (hub maintenance)
    pub(super) tasks: TaskTracker,
}

impl StatusEngine {
    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is ready to serve requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> StatusEngineConfig {
        self.config.read().clone()
    }

    /// The orchestrator for `kind` (guarded by that kind's breaker).
    #[must_use]
    pub fn orchestrator(&self, kind: ServiceKind) -> &FetchOrchestrator {
        self.orchestrators.get(kind)
    }

    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    #[must_use]
    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    #[must_use]
    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Cached, coalesced, breaker-guarded fetch for one resource of `kind`.
    ///
    /// See [`FetchOrchestrator::fetch_with_cache`].
    pub async fn fetch_with_cache<T, F, Fut, E>(
        &self,
        kind: ServiceKind,
        token: &CancellationToken,
        key: &str,
        fetch: F,
    ) -> Result<Fetched<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.orchestrators.get(kind).fetch_with_cache(token, key, fetch).await
    }

    /// Subscribe to status events.
    pub fn register(&self) -> Result<Subscription, HubError> {
        self.hub.register()
    }

    /// Add a resource to the refresh cycle.
    pub fn monitor(&self, resource: MonitoredResource) {
        self.scheduler.monitor(resource);
    }

    pub fn unmonitor(&self, key: &str) -> bool {
        self.scheduler.unmonitor(key)
    }

    /// Keys currently in the refresh cycle.
    #[must_use]
    pub fn monitored(&self) -> Vec<String> {
        self.scheduler.monitored()
    }

    /// Run one refresh cycle now, outside the regular interval.
    pub async fn refresh_now(&self) -> CycleReport {
        self.scheduler.run_cycle(&self.shutdown).await
    }

    /// Snapshot for health endpoints. No I/O.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let open_circuits = self.breakers.open();
        HealthCheck {
            state,
            ready: matches!(state, EngineState::Ready | EngineState::Running),
            cache_backend: self.cache.name(),
            subscribers: self.hub.subscriber_count(),
            monitored: self.monitored().len(),
            healthy: state == EngineState::Running && open_circuits.is_empty(),
            open_circuits,
        }
    }
}

impl std::fmt::Debug for StatusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusEngine")
            .field("state", &self.state())
            .field("cache", &self.cache.name())
            .field("hub", &self.hub)
            .finish()
    }
}
