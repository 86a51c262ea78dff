// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: connect, run loop, shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastHub;
use crate::change::ChangeDetector;
use crate::config::StatusEngineConfig;
use crate::scheduler::RefreshScheduler;
use crate::services::{BreakerRegistry, OrchestratorRegistry};
use crate::storage::local::ReadThroughStore;
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::{CacheStore, StorageError};

use super::{EngineError, EngineState, StatusEngine};

impl StatusEngine {
    /// Validate `config`, build the cache backend and wire every component.
    ///
    /// Startup flow:
    /// 1. Validate configuration
    /// 2. Build the cache: Redis (behind a local read-through layer) when
    ///    `redis_url` is set, otherwise in-memory, restoring persistent keys
    ///    from `persist_path` if given
    /// 3. Create breakers, orchestrators, detector, hub and scheduler
    /// 4. Ready!
    #[tracing::instrument(skip_all, fields(has_redis = config.redis_url.is_some()))]
    pub async fn connect(
        config: StatusEngineConfig,
        config_rx: watch::Receiver<StatusEngineConfig>,
    ) -> Result<Self, EngineError> {
        let startup_start = std::time::Instant::now();
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state(EngineState::Created.as_str());

        // ========== PHASE 1: Validate ==========
        config.validate()?;
        state_tx.send_replace(EngineState::Connecting);
        crate::metrics::set_engine_state(EngineState::Connecting.as_str());
        info!("Starting status engine...");

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        // ========== PHASE 2: Cache backend ==========
        let cache = {
            let _timer = crate::metrics::PhaseTimer::new("cache_connect");
            build_cache(&config, &shutdown).await?
        };
        info!(backend = cache.name(), "Cache backend ready");

        // ========== PHASE 3: Components ==========
        let breakers = BreakerRegistry::new(&config.circuit_config());
        let orchestrators = OrchestratorRegistry::new(Arc::clone(&cache), &breakers, &config.orchestrator_config());
        let detector = Arc::new(ChangeDetector::new());
        let hub = BroadcastHub::new(config.hub_config());
        let scheduler = Arc::new(RefreshScheduler::new(
            orchestrators.clone(),
            Arc::clone(&detector),
            hub.clone(),
            config.refresh_concurrency,
        ));

        state_tx.send_replace(EngineState::Ready);
        crate::metrics::set_engine_state(EngineState::Ready.as_str());
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Status engine ready");

        Ok(Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            cache,
            breakers,
            orchestrators,
            detector,
            hub,
            scheduler,
            shutdown,
            tasks,
        })
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    /// Run hub maintenance, periodic refresh and config updates until
    /// [`shutdown()`](Self::shutdown) is called.
    ///
    /// The first refresh cycle starts immediately.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Ready {
            return Err(EngineError::InvalidState(state));
        }
        self.set_state(EngineState::Running);
        info!("Status engine running");

        let hub = self.hub.clone();
        let hub_token = self.shutdown.child_token();
        self.tasks.spawn(async move { hub.run(hub_token).await });

        let mut period = self.config.read().refresh_interval();
        let mut refresh = tokio::time::interval(period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut config_rx = self.config_rx.lock().await;
        let mut config_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                changed = config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        debug!("Config sender dropped, keeping current config");
                        config_open = false;
                        continue;
                    }
                    let new_config = config_rx.borrow_and_update().clone();
                    if let Err(e) = new_config.validate() {
                        warn!(error = %e, "Ignoring invalid config update");
                        continue;
                    }
                    let new_period = new_config.refresh_interval();
                    if new_period != period {
                        info!(old = ?period, new = ?new_period, "Refresh interval updated");
                        period = new_period;
                        refresh = tokio::time::interval_at(Instant::now() + period, period);
                        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    *self.config.write() = new_config;
                }

                _ = refresh.tick() => {
                    self.scheduler.run_cycle(&self.shutdown).await;
                }
            }
        }

        debug!("Run loop stopped");
        Ok(())
    }

    /// Initiate graceful shutdown: cancel background work, wait for it,
    /// then close the hub, the orchestrators and the cache.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let state = self.state();
        if matches!(state, EngineState::ShuttingDown | EngineState::Stopped) {
            return Err(EngineError::InvalidState(state));
        }

        let shutdown_start = std::time::Instant::now();
        info!("Initiating status engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(Duration::from_secs(10), self.tasks.wait()).await.is_err() {
            warn!(remaining = self.tasks.len(), "Background tasks still running after shutdown timeout");
        }

        if let Err(e) = self.hub.close().await {
            debug!(error = %e, "Hub already closed");
        }
        if let Err(e) = self.orchestrators.close().await {
            debug!(error = %e, "Orchestrators already closed");
        }
        let cache_result = match self.cache.close().await {
            Ok(()) | Err(StorageError::Closed) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Cache close failed");
                Err(EngineError::Storage(e))
            }
        };

        self.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Status engine shutdown complete");
        cache_result
    }
}

async fn build_cache(
    config: &StatusEngineConfig,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn CacheStore>, StorageError> {
    let ttl = config.ttl_policy();

    if let Some(ref url) = config.redis_url {
        info!(prefix = config.redis_prefix.as_deref().unwrap_or(""), "Connecting to Redis...");
        let redis = RedisStore::connect(url, config.redis_prefix.as_deref(), ttl, shutdown.child_token()).await?;
        let store: Arc<dyn CacheStore> = match config.local_cache_ttl() {
            Some(local_ttl) => Arc::new(ReadThroughStore::new(redis, local_ttl)),
            None => Arc::new(redis),
        };
        return Ok(store);
    }

    let memory = match config.persist_path {
        Some(ref path) => Arc::new(InMemoryStore::with_persistence(ttl, path).await?),
        None => Arc::new(InMemoryStore::with_policy(ttl)),
    };
    // Stops when the store is closed.
    memory.spawn_cleanup(Duration::from_secs(config.cleanup_interval_secs));
    Ok(memory)
}
