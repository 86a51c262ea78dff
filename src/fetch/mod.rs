// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stale-while-revalidate fetch orchestration.
//!
//! [`FetchOrchestrator::fetch_with_cache`] is the single entry point every
//! data-fetching call site goes through:
//!
//! ```text
//!            ┌─────────────┐ hit (near expiry? → background refresh)
//! request ──▶│ cache[key]  │────────────────────────────────────────▶ Cache
//!            └─────────────┘
//!                  │ miss
//!                  ▼
//!            ┌─────────────┐ open
//!            │  breaker    │──────▶ cache[key:stale] ──────────────▶ Stale
//!            └─────────────┘                 └── none ─────────────▶ Unavailable
//!                  │ closed / half-open
//!                  ▼
//!            ┌─────────────┐ ok: record success, write fresh + stale ─▶ Upstream
//!            │ coalesce →  │
//!            │ retry(fetch)│ err: record failure ──▶ stale ──────────▶ Stale
//!            └─────────────┘                 └── none ─────────────▶ UpstreamFailed
//! ```
//!
//! The upstream call runs in its own task (see [`crate::coalesce`]), so a
//! caller that gives up (cancelled or past `fetch_timeout`) leaves it running
//! for the other waiters. The breaker outcome and both cache writes happen
//! inside that shared call, once per actual upstream request.
//!
//! Values are cached as JSON. Callers sharing a key must use the same value type.

mod types;
mod refresh;

pub use refresh::RefreshPool;
pub use types::{BoxError, FetchError, FetchSource, Fetched, FreshnessPolicy, OrchestratorConfig};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coalesce::{CoalesceError, Coalesced, Coalescer};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::{retry, RetryConfig, RetryError};
use crate::storage::{stale_key, CacheEntry, CacheStore};

type Payload = Arc<Vec<u8>>;

struct Shared {
    cache: Arc<dyn CacheStore>,
    breaker: Arc<CircuitBreaker>,
    coalescer: Coalescer<Payload, FetchError>,
    retry: RetryConfig,
    policy: FreshnessPolicy,
    refresher: RefreshPool,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Cache + breaker + coalescer + retry, composed.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct FetchOrchestrator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("cache", &self.shared.cache.name())
            .field("breaker", &self.shared.breaker.name())
            .field("policy", &self.shared.policy)
            .field("in_flight", &self.shared.coalescer.len())
            .finish()
    }
}

impl FetchOrchestrator {
    pub fn new(cache: Arc<dyn CacheStore>, breaker: Arc<CircuitBreaker>, config: OrchestratorConfig) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            shared: Arc::new(Shared {
                cache,
                breaker,
                coalescer: Coalescer::new(),
                retry: config.retry,
                policy: config.policy,
                refresher: RefreshPool::new(config.max_background_refreshes, shutdown.child_token()),
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }

    #[must_use]
    pub fn policy(&self) -> &FreshnessPolicy {
        &self.shared.policy
    }

    /// Whether an upstream call for `key` is running right now.
    #[must_use]
    pub fn in_flight(&self, key: &str) -> bool {
        self.shared.coalescer.in_flight(key)
    }

    /// Background refreshes currently running.
    #[must_use]
    pub fn background_refreshes(&self) -> usize {
        self.shared.refresher.active()
    }

    /// Return the value for `key`, from cache when fresh, otherwise from
    /// `fetch` (deduplicated and retried), falling back to the stale entry
    /// when the upstream is unhealthy.
    ///
    /// `fetch` receives a token that is cancelled when the orchestrator shuts
    /// down; it is not tied to this caller's `token`, because other callers
    /// may be waiting on the same call.
    pub async fn fetch_with_cache<T, F, Fut, E>(
        &self,
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
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(FetchError::Closed);
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_inner(key, fetch) => result,
        };

        match &result {
            Ok(fetched) => crate::metrics::record_fetch(self.shared.breaker.name(), fetched.source.as_str()),
            Err(e) => crate::metrics::record_fetch(self.shared.breaker.name(), e.kind()),
        }
        result
    }

    async fn fetch_inner<T, F, Fut, E>(&self, key: &str, fetch: F) -> Result<Fetched<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let policy = &self.shared.policy;

        // 1. Fresh cache entry
        if let Some(entry) = self.read(key).await {
            match decode::<T>(&entry.payload) {
                Ok(value) => {
                    if entry.remaining_ttl() < policy.near_expiry {
                        self.spawn_refresh(key, fetch);
                    }
                    return Ok(Fetched { value, source: FetchSource::Cache });
                }
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable cache entry");
                    if let Err(e) = self.shared.cache.delete(key).await {
                        debug!(key, error = %e, "Failed to delete undecodable entry");
                    }
                }
            }
        }

        // 2. Breaker open: stale or unavailable, never the upstream
        if self.shared.breaker.is_open() {
            self.shared.breaker.note_rejection();
            debug!(key, circuit = %self.shared.breaker.name(), "Circuit open, trying stale entry");
            return self
                .stale_or(key, FetchError::Unavailable { key: key.to_string() })
                .await;
        }

        // 3. One upstream call per key, bounded by the caller's wait budget
        let shared = Arc::clone(&self.shared);
        let owned_key = key.to_string();
        let call = self
            .shared
            .coalescer
            .run(key, move || upstream_call::<T, F, Fut, E>(shared, owned_key, fetch));

        match tokio::time::timeout(policy.fetch_timeout, call).await {
            Ok(Coalesced { result: Ok(payload), .. }) => {
                let value = decode::<T>(&payload)?;
                Ok(Fetched { value, source: FetchSource::Upstream })
            }
            // 5. Failure: stale or the underlying error
            Ok(Coalesced { result: Err(CoalesceError::Inner(e)), .. }) => self.stale_or(key, e).await,
            Ok(Coalesced { result: Err(CoalesceError::Aborted), .. }) => {
                self.stale_or(key, FetchError::Internal(format!("upstream call for '{key}' aborted")))
                    .await
            }
            Err(_) => {
                warn!(key, timeout = ?policy.fetch_timeout, "Upstream call exceeded wait budget");
                self.stale_or(key, FetchError::TimedOut(policy.fetch_timeout)).await
            }
        }
    }

    /// Cache read where any backend failure counts as a miss. Only failures
    /// other than an unreachable backend are logged as warnings.
    async fn read(&self, key: &str) -> Option<CacheEntry> {
        let backend = self.shared.cache.name();
        match self.shared.cache.get(key).await {
            Ok(Some(entry)) => {
                crate::metrics::record_cache_lookup(backend, "hit");
                Some(entry)
            }
            Ok(None) => {
                crate::metrics::record_cache_lookup(backend, "miss");
                None
            }
            Err(e) if e.is_miss() => {
                debug!(key, backend, error = %e, "Cache unreachable, treating as miss");
                crate::metrics::record_cache_lookup(backend, "miss");
                None
            }
            Err(e) => {
                warn!(key, backend, error = %e, "Cache read failed, treating as miss");
                crate::metrics::record_cache_lookup(backend, "error");
                None
            }
        }
    }

    async fn stale_or<T>(&self, key: &str, err: FetchError) -> Result<Fetched<T>, FetchError>
    where
        T: DeserializeOwned,
    {
        let Some(entry) = self.read(&stale_key(key)).await else {
            return Err(err);
        };
        match decode::<T>(&entry.payload) {
            Ok(value) => {
                debug!(key, reason = err.kind(), "Serving stale entry");
                Ok(Fetched { value, source: FetchSource::Stale })
            }
            Err(e) => {
                warn!(key, error = %e, "Stale entry undecodable");
                Err(err)
            }
        }
    }

    fn spawn_refresh<T, F, Fut, E>(&self, key: &str, fetch: F)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        if self.shared.breaker.is_open() || self.shared.coalescer.in_flight(key) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let owned_key = key.to_string();
        let started = self.shared.refresher.spawn(key, async move {
            let call_shared = Arc::clone(&shared);
            let call_key = owned_key.clone();
            let outcome = shared
                .coalescer
                .run(&owned_key, move || upstream_call::<T, F, Fut, E>(call_shared, call_key, fetch))
                .await;
            match outcome.result {
                Ok(_) => crate::metrics::record_background_refresh("ok"),
                Err(e) => {
                    debug!(key = %owned_key, error = %e, "Background refresh failed");
                    crate::metrics::record_background_refresh("error");
                }
            }
        });
        if started {
            debug!(key, "Background refresh started");
        }
    }

    /// Drop both the fresh and the stale entry for `key`.
    pub async fn invalidate(&self, key: &str) -> Result<(), FetchError> {
        let cache = &self.shared.cache;
        let fresh = cache.delete(key).await;
        let stale = cache.delete(&stale_key(key)).await;
        fresh.and(stale).map_err(|e| FetchError::Internal(e.to_string()))
    }

    /// Stop background refreshes and cancel running upstream calls.
    ///
    /// Does not close the cache, which may be shared with other orchestrators.
    pub async fn close(&self) -> Result<(), FetchError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(FetchError::Closed);
        }
        self.shared.shutdown.cancel();
        self.shared.refresher.close().await;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(payload).map_err(|e| FetchError::Decode(e.to_string()))
}

/// The shared execution: retry the fetch, record the breaker outcome, write
/// fresh and stale entries.
async fn upstream_call<T, F, Fut, E>(shared: Arc<Shared>, key: String, fetch: F) -> Result<Payload, FetchError>
where
    T: Serialize + Send + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let token = shared.shutdown.child_token();
    let upstream = shared.breaker.name().to_string();
    let started = Instant::now();

    let result = retry(&token, &key, &shared.retry, || {
        let fut = fetch(token.clone());
        async move { fut.await.map_err(Into::<BoxError>::into) }
    })
    .await;

    crate::metrics::record_upstream_latency(&upstream, started.elapsed());

    let payload = match result {
        Ok(value) => {
            shared.breaker.record_success();
            crate::metrics::record_upstream_call(&upstream, "success");
            serde_json::to_vec(&value).map_err(|e| FetchError::Encode(e.to_string()))?
        }
        Err(RetryError::Exhausted { attempts, last }) => {
            shared.breaker.record_failure();
            crate::metrics::record_upstream_call(&upstream, "failure");
            return Err(FetchError::UpstreamFailed {
                key,
                attempts,
                cause: Arc::from(last),
            });
        }
        Err(RetryError::Cancelled { .. }) => {
            crate::metrics::record_upstream_call(&upstream, "cancelled");
            return Err(FetchError::Cancelled);
        }
    };

    let policy = &shared.policy;
    if let Err(e) = shared.cache.set(&key, payload.clone(), policy.fresh_ttl).await {
        warn!(key = %key, error = %e, "Failed to cache fresh value");
    }
    if let Err(e) = shared.cache.set(&stale_key(&key), payload.clone(), policy.stale_ttl).await {
        warn!(key = %key, error = %e, "Failed to cache stale value");
    }

    Ok(Arc::new(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct Refused;

    fn fast_config(policy: FreshnessPolicy) -> OrchestratorConfig {
        OrchestratorConfig {
            policy,
            retry: RetryConfig {
                max_attempts: Some(3),
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                factor: 2.0,
            },
            max_background_refreshes: 4,
        }
    }

    fn setup(threshold: u32, policy: FreshnessPolicy) -> (Arc<InMemoryStore>, FetchOrchestrator) {
        let cache = Arc::new(InMemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "radarr",
            CircuitConfig::new(threshold, Duration::from_secs(60)),
        ));
        let orchestrator = FetchOrchestrator::new(cache.clone(), breaker, fast_config(policy));
        (cache, orchestrator)
    }

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl Fn(CancellationToken) -> futures::future::BoxFuture<'static, Result<Vec<u32>, Refused>> + Clone + Send + Sync + 'static
    {
        move |_token| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(vec![1, 2, 3])
            })
        }
    }

    #[tokio::test]
    async fn test_miss_fetches_and_populates_both_entries() {
        let (cache, orchestrator) = setup(5, FreshnessPolicy::default());
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = orchestrator
            .fetch_with_cache(&token, "radarr:queue", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(got.value, vec![1, 2, 3]);
        assert_eq!(got.source, FetchSource::Upstream);
        assert!(cache.get("radarr:queue").await.unwrap().is_some());
        assert!(cache.get("radarr:queue:stale").await.unwrap().is_some());

        let again = orchestrator
            .fetch_with_cache(&token, "radarr:queue", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(again.source, FetchSource::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_invoke_fetch_once() {
        let (_cache, orchestrator) = setup(5, FreshnessPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let orchestrator = orchestrator.clone();
            let fetch = counting_fetch(calls.clone(), Duration::from_millis(100));
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                orchestrator.fetch_with_cache(&token, "sonarr:calendar", fetch).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_served_while_breaker_open() {
        let (cache, orchestrator) = setup(5, FreshnessPolicy::default());
        cache
            .set("plex:sessions:stale", serde_json::to_vec(&vec![9u32]).unwrap(), Duration::from_secs(300))
            .await
            .unwrap();
        for _ in 0..5 {
            orchestrator.breaker().record_failure();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let got = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "plex:sessions", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(got.value, vec![9]);
        assert!(got.is_stale());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_open_without_stale_is_unavailable() {
        let (_cache, orchestrator) = setup(1, FreshnessPolicy::default());
        orchestrator.breaker().record_failure();

        let calls = Arc::new(AtomicUsize::new(0));
        let err = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "plex:sessions", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Unavailable { ref key } if key == "plex:sessions"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_returns_last_upstream_error() {
        let (_cache, orchestrator) = setup(5, FreshnessPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let err = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "lidarr:status", move |_t| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(Refused)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match &err {
            FetchError::UpstreamFailed { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(err.upstream_cause().unwrap().downcast_ref::<Refused>().is_some());
        // One failure per upstream call, not per retry attempt.
        assert_eq!(orchestrator.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_stale() {
        let (cache, orchestrator) = setup(5, FreshnessPolicy::default());
        cache
            .set("lidarr:status:stale", serde_json::to_vec(&7u32).unwrap(), Duration::from_secs(300))
            .await
            .unwrap();

        let got = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "lidarr:status", |_t| async {
                Err::<u32, _>("503 Service Unavailable")
            })
            .await
            .unwrap();

        assert_eq!(got.value, 7);
        assert_eq!(got.source, FetchSource::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_expiry_hit_refreshes_in_background() {
        let policy = FreshnessPolicy {
            near_expiry: Duration::from_secs(5),
            ..FreshnessPolicy::default()
        };
        let (cache, orchestrator) = setup(5, policy);
        cache
            .set("tautulli:activity", serde_json::to_vec(&vec![0u32]).unwrap(), Duration::from_secs(3))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let got = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "tautulli:activity", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got.value, vec![0]);
        assert_eq!(got.source, FetchSource::Cache);

        // Let the refresh task run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let refreshed = cache.get("tautulli:activity").await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<Vec<u32>>(&refreshed.payload).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_caller_returns_promptly_and_call_completes() {
        let (cache, orchestrator) = setup(5, FreshnessPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = orchestrator
            .fetch_with_cache(&token, "sabnzbd:queue", counting_fetch(calls.clone(), Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));

        // The shared call keeps going and still fills the cache.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get("sabnzbd:queue").await.unwrap().is_some());
        assert!(!orchestrator.in_flight("sabnzbd:queue"));
        assert_eq!(orchestrator.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_budget_exceeded_times_out() {
        let policy = FreshnessPolicy {
            fetch_timeout: Duration::from_millis(20),
            ..FreshnessPolicy::default()
        };
        let (_cache, orchestrator) = setup(5, policy);
        let calls = Arc::new(AtomicUsize::new(0));

        let err = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "nzbget:status", counting_fetch(calls, Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TimedOut(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_refetched() {
        let (cache, orchestrator) = setup(5, FreshnessPolicy::default());
        cache.set("deluge:torrents", b"not json".to_vec(), Duration::from_secs(30)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let got = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "deluge:torrents", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got.source, FetchSource::Upstream);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_recovery_scenario() {
        let policy = FreshnessPolicy {
            fresh_ttl: Duration::from_secs(2),
            stale_ttl: Duration::from_secs(300),
            near_expiry: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(15),
        };
        let (cache, orchestrator) = setup(5, policy);
        let breaker = orchestrator.breaker().clone();

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!breaker.is_open());

        let calls = Arc::new(AtomicUsize::new(0));
        let got = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "overseerr:requests", counting_fetch(calls, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got.source, FetchSource::Upstream);

        let fresh = cache.get("overseerr:requests").await.unwrap().unwrap();
        let stale = cache.get("overseerr:requests:stale").await.unwrap().unwrap();
        assert!(fresh.remaining_ttl() <= Duration::from_secs(2));
        assert!(fresh.remaining_ttl() > Duration::from_secs(1));
        assert!(stale.remaining_ttl() <= Duration::from_secs(300));
        assert!(stale.remaining_ttl() > Duration::from_secs(299));
        assert_eq!(breaker.failure_count(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("overseerr:requests").await.unwrap().is_none());
        assert!(cache.get("overseerr:requests:stale").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_close() {
        let (cache, orchestrator) = setup(5, FreshnessPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        orchestrator
            .fetch_with_cache(&CancellationToken::new(), "prowlarr:indexers", counting_fetch(calls.clone(), Duration::ZERO))
            .await
            .unwrap();

        orchestrator.invalidate("prowlarr:indexers").await.unwrap();
        assert!(cache.is_empty());

        orchestrator.close().await.unwrap();
        assert!(matches!(orchestrator.close().await, Err(FetchError::Closed)));
        let err = orchestrator
            .fetch_with_cache(&CancellationToken::new(), "prowlarr:indexers", counting_fetch(calls, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Closed));
    }
}
