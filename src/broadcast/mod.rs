// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Non-blocking fan-out to SSE subscribers.
//!
//! ```text
//! publish(event)
//!     │
//!     ├──► [outbox 1] try_send ok ─────────────────────────▶ Subscription 1
//!     ├──► [outbox 2] full → one deferred send_timeout task ─▶ Subscription 2
//!     │                      (later events dropped while it is pending)
//!     └──► [outbox N] closed → subscriber removed
//! ```
//!
//! ## Rules
//! - **Non-blocking**: `publish()` only uses `try_send`; a full outbox gets a
//!   single spawned send bounded by `send_timeout`, so the publisher never
//!   waits on any subscriber
//! - **Isolation**: a stalled subscriber loses its own events, nobody else's
//! - **Per-subscriber FIFO**: at most one deferred send per subscriber is in
//!   flight and events arriving meanwhile are dropped, never reordered
//! - **Eventual delivery**: dropped events are not retried; the next refresh
//!   cycle republishes current state
//!
//! ## Maintenance
//! [`BroadcastHub::run`] drives keepalive heartbeats and a periodic sweep that
//! evicts subscribers past their maximum connection age or idle (no
//! successful delivery) for longer than the inactivity timeout.

pub mod event;
pub mod sse;
mod subscription;

pub use event::{Event, HEARTBEAT_KIND};
pub use subscription::Subscription;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Identifier assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Per-subscriber lifecycle: `Connected → Streaming → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connected,
    Streaming,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Client went away (handle dropped, outbox receiver closed)
    ClientClosed,
    /// Explicit [`BroadcastHub::unsubscribe`]
    Unsubscribed,
    /// Connection older than `max_connection_age`
    MaxAge,
    /// No successful delivery within `inactivity_timeout`
    Inactive,
    /// Hub closed
    HubClosed,
}

impl EvictReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Unsubscribed => "unsubscribed",
            Self::MaxAge => "max_age",
            Self::Inactive => "inactive",
            Self::HubClosed => "hub_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("broadcast hub is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Events buffered per subscriber
    pub outbox_capacity: usize,
    /// Longest a deferred send waits on a full outbox
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    /// Connections older than this are closed to force a reconnect
    pub max_connection_age: Duration,
    /// Subscribers with no successful delivery for this long are evicted
    pub inactivity_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 16,
            send_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(25),
            sweep_interval: Duration::from_secs(60),
            max_connection_age: Duration::from_secs(3600),
            inactivity_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of one [`BroadcastHub::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Placed directly into an outbox
    pub delivered: usize,
    /// Outbox full, handed to a bounded deferred send
    pub deferred: usize,
    /// Dropped because a deferred send was already pending
    pub dropped: usize,
    /// Subscribers found closed and removed
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

struct Slot {
    tx: mpsc::Sender<Event>,
    connected_at: Instant,
    last_active: Mutex<Instant>,
    state: Mutex<SubscriberState>,
    pending: AtomicBool,
    dropped: AtomicU64,
}

impl Slot {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

pub(crate) struct HubInner {
    config: HubConfig,
    slots: DashMap<SubscriberId, Arc<Slot>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    deferred: TaskTracker,
    delivered_total: AtomicU64,
    dropped_total: AtomicU64,
    evicted_total: AtomicU64,
}

impl HubInner {
    pub(crate) fn state_of(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.slots.get(&id).map(|slot| *slot.state.lock())
    }

    /// Remove a subscriber. Dropping the slot drops its sender, which ends
    /// the client's stream once any in-flight deferred send settles.
    pub(crate) fn remove(&self, id: SubscriberId, reason: EvictReason) -> bool {
        let Some((_, slot)) = self.slots.remove(&id) else {
            return false;
        };
        *slot.state.lock() = SubscriberState::Disconnected;
        self.evicted_total.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = %id, reason = reason.as_str(), "Subscriber disconnected");
        crate::metrics::record_subscriber_evicted(reason.as_str());
        crate::metrics::set_subscribers(self.slots.len());
        true
    }

    fn snapshot(&self) -> Vec<(SubscriberId, Arc<Slot>)> {
        self.slots
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }
}

/// Registry of live subscribers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("config", &self.inner.config)
            .field("subscribers", &self.inner.slots.len())
            .finish()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                deferred: TaskTracker::new(),
                delivered_total: AtomicU64::new(0),
                dropped_total: AtomicU64::new(0),
                evicted_total: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Add a subscriber with a fresh bounded outbox.
    pub fn register(&self) -> Result<Subscription, HubError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HubError::Closed);
        }
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.config.outbox_capacity.max(1));
        let now = Instant::now();
        let slot = Arc::new(Slot {
            tx,
            connected_at: now,
            last_active: Mutex::new(now),
            state: Mutex::new(SubscriberState::Connected),
            pending: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.inner.slots.insert(id, Arc::clone(&slot));
        *slot.state.lock() = SubscriberState::Streaming;

        debug!(subscriber = %id, total = self.inner.slots.len(), "Subscriber registered");
        crate::metrics::set_subscribers(self.inner.slots.len());
        Ok(Subscription::new(id, rx, Arc::downgrade(&self.inner)))
    }

    /// Remove a subscriber by id.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.remove(id, EvictReason::Unsubscribed)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fan `event` out to every live subscriber without blocking.
    ///
    /// Must be called from within a tokio runtime (deferred sends are spawned).
    pub fn publish(&self, event: Event) -> PublishReport {
        let mut report = PublishReport::default();
        if self.is_closed() {
            return report;
        }

        for (id, slot) in self.inner.snapshot() {
            if slot.pending.load(Ordering::Acquire) {
                self.note_dropped(&slot);
                report.dropped += 1;
                continue;
            }

            match slot.tx.try_send(event.clone()) {
                Ok(()) => {
                    slot.touch();
                    self.inner.delivered_total.fetch_add(1, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(TrySendError::Full(event)) => {
                    if slot.pending.swap(true, Ordering::AcqRel) {
                        self.note_dropped(&slot);
                        report.dropped += 1;
                        continue;
                    }
                    report.deferred += 1;
                    self.spawn_deferred(id, slot, event);
                }
                Err(TrySendError::Closed(_)) => {
                    if self.inner.remove(id, EvictReason::ClientClosed) {
                        report.evicted += 1;
                    }
                }
            }
        }

        crate::metrics::record_publish(report.delivered, report.deferred, report.dropped);
        report
    }

    fn spawn_deferred(&self, id: SubscriberId, slot: Arc<Slot>, event: Event) {
        let inner = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.send_timeout;
        self.inner.deferred.spawn(async move {
            let outcome = slot.tx.send_timeout(event, timeout).await;
            slot.pending.store(false, Ordering::Release);
            let Some(inner) = inner.upgrade() else { return };
            match outcome {
                Ok(()) => {
                    slot.touch();
                    inner.delivered_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    inner.dropped_total.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_publish(0, 0, 1);
                    debug!(subscriber = %id, timeout = ?timeout, "Outbox still full, event dropped");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    inner.remove(id, EvictReason::ClientClosed);
                }
            }
        });
    }

    fn note_dropped(&self, slot: &Slot) {
        slot.dropped.fetch_add(1, Ordering::Relaxed);
        self.inner.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Send a keepalive to every subscriber idle for at least half the
    /// heartbeat interval. Never waits: a full outbox simply misses it.
    pub fn send_heartbeats(&self) -> usize {
        let idle_after = self.inner.config.heartbeat_interval / 2;
        let mut sent = 0;
        for (id, slot) in self.inner.snapshot() {
            if slot.pending.load(Ordering::Acquire) || slot.last_active.lock().elapsed() < idle_after {
                continue;
            }
            match slot.tx.try_send(Event::heartbeat()) {
                Ok(()) => {
                    slot.touch();
                    sent += 1;
                }
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => {
                    self.inner.remove(id, EvictReason::ClientClosed);
                }
            }
        }
        sent
    }

    /// Evict subscribers past their maximum age or idle too long.
    pub fn sweep(&self) -> usize {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut evicted = 0;

        for (id, slot) in self.inner.snapshot() {
            let reason = if now.saturating_duration_since(slot.connected_at) >= config.max_connection_age {
                Some(EvictReason::MaxAge)
            } else if now.saturating_duration_since(*slot.last_active.lock()) >= config.inactivity_timeout {
                Some(EvictReason::Inactive)
            } else if slot.tx.is_closed() {
                Some(EvictReason::ClientClosed)
            } else {
                None
            };
            if let Some(reason) = reason {
                if self.inner.remove(id, reason) {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.inner.slots.len(), "Swept subscribers");
        }
        evicted
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.inner.slots.len(),
            delivered: self.inner.delivered_total.load(Ordering::Relaxed),
            dropped: self.inner.dropped_total.load(Ordering::Relaxed),
            evicted: self.inner.evicted_total.load(Ordering::Relaxed),
        }
    }

    /// Events dropped for one subscriber so far.
    #[must_use]
    pub fn dropped_for(&self, id: SubscriberId) -> Option<u64> {
        self.inner.slots.get(&id).map(|slot| slot.dropped.load(Ordering::Relaxed))
    }

    /// Heartbeat and sweep until `token` is cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, token: CancellationToken) {
        let config = &self.inner.config;
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        let mut sweep = tokio::time::interval(config.sweep_interval);
        heartbeat.tick().await;
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = heartbeat.tick() => {
                    let sent = self.send_heartbeats();
                    if sent > 0 {
                        debug!(sent, "Heartbeats sent");
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }
        debug!("Hub maintenance loop stopped");
    }

    /// Disconnect everyone and wait for deferred sends to settle.
    pub async fn close(&self) -> Result<(), HubError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(HubError::Closed);
        }
        let ids: Vec<SubscriberId> = self.inner.slots.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.inner.remove(id, EvictReason::HubClosed);
        }
        self.inner.deferred.close();
        self.inner.deferred.wait().await;
        if !self.inner.slots.is_empty() {
            warn!(remaining = self.inner.slots.len(), "Subscribers registered during close");
        }
        info!("Broadcast hub closed");
        Ok(())
    }
}
