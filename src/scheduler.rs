// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic refresh of monitored resources.
//!
//! One cycle walks every registered [`MonitoredResource`]:
//!
//! ```text
//! resource ──▶ orchestrator.fetch_with_cache ──▶ status document
//!                (≤ concurrency at once)              │
//!                                                     ▼
//!                                          ChangeDetector::observe
//!                                                     │ changed (or Always)
//!                                                     ▼
//!                                            BroadcastHub::publish
//! ```
//!
//! Failures become an `error` status document that goes through the same
//! detector, so a service that stays down is announced once, not every cycle.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastHub, Event};
use crate::change::ChangeDetector;
use crate::fetch::{BoxError, FetchError, FetchOrchestrator, FetchSource};
use crate::services::{OrchestratorRegistry, ServiceKind};

/// Something that can report the current status of one resource.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, token: CancellationToken) -> Result<Value, BoxError>;
}

/// [`StatusSource`] backed by an async closure.
pub struct FnSource<F>(F);

#[async_trait]
impl<F, Fut> StatusSource for FnSource<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BoxError>> + Send,
{
    async fn fetch(&self, token: CancellationToken) -> Result<Value, BoxError> {
        (self.0)(token).await
    }
}

/// Wrap an async closure as a shareable [`StatusSource`].
pub fn source_fn<F, Fut>(f: F) -> Arc<dyn StatusSource>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    Arc::new(FnSource(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Publish only when the status document changed
    #[default]
    OnChange,
    /// Publish every cycle
    Always,
}

#[derive(Clone)]
pub struct MonitoredResource {
    /// Cache key and event subject (e.g. `"radarr:queue"`)
    pub key: String,
    pub service: ServiceKind,
    pub source: Arc<dyn StatusSource>,
    pub policy: PublishPolicy,
}

impl MonitoredResource {
    pub fn new(key: impl Into<String>, service: ServiceKind, source: Arc<dyn StatusSource>) -> Self {
        Self {
            key: key.into(),
            service,
            source,
            policy: PublishPolicy::OnChange,
        }
    }

    #[must_use]
    pub fn always_publish(mut self) -> Self {
        self.policy = PublishPolicy::Always;
        self
    }
}

impl std::fmt::Debug for MonitoredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredResource")
            .field("key", &self.key)
            .field("service", &self.service)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Totals for one refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Resources that produced a value (cache, upstream or stale)
    pub fetched: usize,
    /// Status documents that differed from the previous cycle
    pub changed: usize,
    /// Events handed to the hub
    pub published: usize,
    /// Resources whose fetch failed
    pub failed: usize,
}

impl CycleReport {
    fn absorb(&mut self, outcome: Outcome) {
        self.fetched += usize::from(outcome.fetched);
        self.changed += usize::from(outcome.changed);
        self.published += usize::from(outcome.published);
        self.failed += usize::from(outcome.failed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    fetched: bool,
    changed: bool,
    published: bool,
    failed: bool,
}

pub struct RefreshScheduler {
    resources: RwLock<Vec<Arc<MonitoredResource>>>,
    orchestrators: OrchestratorRegistry,
    detector: Arc<ChangeDetector>,
    hub: BroadcastHub,
    permits: Arc<Semaphore>,
}

impl RefreshScheduler {
    pub fn new(
        orchestrators: OrchestratorRegistry,
        detector: Arc<ChangeDetector>,
        hub: BroadcastHub,
        concurrency: usize,
    ) -> Self {
        Self {
            resources: RwLock::new(Vec::new()),
            orchestrators,
            detector,
            hub,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Add a resource, replacing any existing one with the same key.
    pub fn monitor(&self, resource: MonitoredResource) {
        let mut resources = self.resources.write();
        resources.retain(|r| r.key != resource.key);
        debug!(key = %resource.key, service = %resource.service, "Monitoring resource");
        resources.push(Arc::new(resource));
    }

    /// Stop refreshing `key`. Its last fingerprint is forgotten too.
    pub fn unmonitor(&self, key: &str) -> bool {
        let mut resources = self.resources.write();
        let before = resources.len();
        resources.retain(|r| r.key != key);
        let removed = resources.len() != before;
        if removed {
            self.detector.forget(key);
        }
        removed
    }

    #[must_use]
    pub fn monitored(&self) -> Vec<String> {
        self.resources.read().iter().map(|r| r.key.clone()).collect()
    }

    /// Refresh every resource once.
    #[tracing::instrument(skip_all)]
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let resources: Vec<Arc<MonitoredResource>> = self.resources.read().clone();
        let mut join_set: JoinSet<Outcome> = JoinSet::new();

        for resource in resources {
            let permits = Arc::clone(&self.permits);
            let orchestrator = self.orchestrators.get(resource.service).clone();
            let detector = Arc::clone(&self.detector);
            let hub = self.hub.clone();
            let token = token.clone();

            join_set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Outcome::default(),
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Outcome::default(),
                    },
                };
                refresh_one(&orchestrator, &detector, &hub, &resource, &token).await
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    warn!(error = %e, "Refresh task panicked");
                    report.failed += 1;
                }
            }
        }

        let elapsed = started.elapsed();
        crate::metrics::record_refresh_cycle(elapsed, report.changed, report.failed);
        info!(
            fetched = report.fetched,
            changed = report.changed,
            published = report.published,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Refresh cycle complete"
        );
        report
    }
}

async fn refresh_one(
    orchestrator: &FetchOrchestrator,
    detector: &ChangeDetector,
    hub: &BroadcastHub,
    resource: &MonitoredResource,
    token: &CancellationToken,
) -> Outcome {
    let source = Arc::clone(&resource.source);
    let fetched = orchestrator
        .fetch_with_cache(token, &resource.key, move |t| {
            let source = Arc::clone(&source);
            async move { source.fetch(t).await }
        })
        .await;

    let mut outcome = Outcome::default();
    let (status, document) = match fetched {
        Ok(fetched) => {
            outcome.fetched = true;
            let status = match fetched.source {
                FetchSource::Stale => "stale",
                FetchSource::Cache | FetchSource::Upstream => "online",
            };
            (status, status_document(resource.service, status, fetched.value))
        }
        Err(FetchError::Cancelled) | Err(FetchError::Closed) => return outcome,
        Err(e) => {
            outcome.failed = true;
            debug!(key = %resource.key, error = %e, "Refresh failed");
            (
                "error",
                status_document(resource.service, "error", json!({ "error": e.kind() })),
            )
        }
    };

    let change = detector.observe(&resource.key, &document);
    outcome.changed = change.is_changed();

    if change.is_changed() || resource.policy == PublishPolicy::Always {
        let mut event = Event::from_value(resource.key.as_str(), status, document);
        event
            .payload
            .insert("change".to_string(), Value::String(change.kind.as_str().to_string()));
        let report = hub.publish(event);
        outcome.published = true;
        if change.is_changed() {
            debug!(
                key = %resource.key,
                change = %change.kind,
                delivered = report.delivered,
                "Published status change"
            );
        }
    }
    outcome
}

fn status_document(service: ServiceKind, status: &str, data: Value) -> Value {
    json!({
        "service": service.as_str(),
        "status": status,
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::OrchestratorConfig;
    use crate::resilience::retry::RetryConfig;
    use crate::services::BreakerRegistry;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::CacheStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler(hub: &BroadcastHub, concurrency: usize) -> RefreshScheduler {
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryStore::new());
        let config = OrchestratorConfig {
            retry: RetryConfig::test(),
            ..OrchestratorConfig::default()
        };
        let orchestrators = OrchestratorRegistry::new(cache, &BreakerRegistry::default(), &config);
        RefreshScheduler::new(orchestrators, Arc::new(ChangeDetector::new()), hub.clone(), concurrency)
    }

    fn counter_source(value: Arc<AtomicUsize>) -> Arc<dyn StatusSource> {
        source_fn(move |_| {
            let value = value.clone();
            async move { Ok(json!({ "queue": vec![0; value.load(Ordering::SeqCst)] })) }
        })
    }

    #[tokio::test]
    async fn test_publishes_only_on_change() {
        let hub = BroadcastHub::default();
        let mut sub = hub.register().unwrap();
        let scheduler = scheduler(&hub, 2);
        let size = Arc::new(AtomicUsize::new(1));
        scheduler.monitor(MonitoredResource::new("radarr:queue", ServiceKind::Radarr, counter_source(size.clone())));
        let token = CancellationToken::new();

        let first = scheduler.run_cycle(&token).await;
        assert_eq!(first, CycleReport { fetched: 1, changed: 1, published: 1, failed: 0 });
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, "online");
        assert_eq!(event.payload["change"], "initial");

        // Served from cache, identical document.
        let second = scheduler.run_cycle(&token).await;
        assert_eq!(second.published, 0);
        assert!(sub.try_recv().is_none());

        // New content only shows up once the cache is invalidated.
        size.store(3, Ordering::SeqCst);
        scheduler.orchestrators.get(ServiceKind::Radarr).invalidate("radarr:queue").await.unwrap();
        let third = scheduler.run_cycle(&token).await;
        assert_eq!(third.changed, 1);
        assert_eq!(sub.recv().await.unwrap().payload["change"], "added");
    }

    #[tokio::test]
    async fn test_always_policy_publishes_every_cycle() {
        let hub = BroadcastHub::default();
        let mut sub = hub.register().unwrap();
        let scheduler = scheduler(&hub, 1);
        let resource = MonitoredResource::new("plex:sessions", ServiceKind::Plex, counter_source(Arc::new(AtomicUsize::new(0))))
            .always_publish();
        scheduler.monitor(resource);
        let token = CancellationToken::new();

        scheduler.run_cycle(&token).await;
        let report = scheduler.run_cycle(&token).await;
        assert_eq!(report.changed, 0);
        assert_eq!(report.published, 1);
        assert_eq!(sub.recv().await.unwrap().payload["change"], "initial");
        assert_eq!(sub.recv().await.unwrap().payload["change"], "unchanged");
    }

    #[tokio::test]
    async fn test_failure_is_announced_once() {
        let hub = BroadcastHub::default();
        let mut sub = hub.register().unwrap();
        let scheduler = scheduler(&hub, 1);
        scheduler.monitor(MonitoredResource::new(
            "sonarr:queue",
            ServiceKind::Sonarr,
            source_fn(|_| async { Err::<Value, BoxError>("connection refused".into()) }),
        ));
        let token = CancellationToken::new();

        let first = scheduler.run_cycle(&token).await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.published, 1);
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, "error");
        assert_eq!(event.payload["data"]["error"], "upstream_failed");

        let second = scheduler.run_cycle(&token).await;
        assert_eq!(second.failed, 1);
        assert_eq!(second.published, 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let hub = BroadcastHub::default();
        let scheduler = scheduler(&hub, 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for n in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            let source = source_fn(move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({ "ok": true }))
                }
            });
            scheduler.monitor(MonitoredResource::new(format!("general:{n}"), ServiceKind::General, source));
        }

        let report = scheduler.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.fetched, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_monitor_replaces_and_unmonitor_forgets() {
        let hub = BroadcastHub::default();
        let scheduler = scheduler(&hub, 1);
        let called = Arc::new(AtomicBool::new(false));
        let c = called.clone();

        scheduler.monitor(MonitoredResource::new("k", ServiceKind::General, counter_source(Arc::new(AtomicUsize::new(0)))));
        scheduler.monitor(MonitoredResource::new(
            "k",
            ServiceKind::General,
            source_fn(move |_| {
                let c = c.clone();
                async move {
                    c.store(true, Ordering::SeqCst);
                    Ok(json!({}))
                }
            }),
        ));
        assert_eq!(scheduler.monitored(), vec!["k".to_string()]);

        scheduler.run_cycle(&CancellationToken::new()).await;
        assert!(called.load(Ordering::SeqCst));
        assert!(scheduler.detector.last("k").is_some());

        assert!(scheduler.unmonitor("k"));
        assert!(scheduler.detector.last("k").is_none());
        assert!(!scheduler.unmonitor("k"));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_reports_nothing() {
        let hub = BroadcastHub::default();
        let scheduler = scheduler(&hub, 1);
        scheduler.monitor(MonitoredResource::new("k", ServiceKind::General, counter_source(Arc::new(AtomicUsize::new(0)))));
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(scheduler.run_cycle(&token).await, CycleReport::default());
    }
}
