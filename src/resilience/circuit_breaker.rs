// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Windowed circuit breaker.
//!
//! Protects flaky upstreams from being hammered while they are down. Failures
//! are counted within a trailing window; once the count reaches the threshold
//! the breaker trips and rejects calls for one window length.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Upstream unhealthy, requests fail-fast without attempting
//! - HalfOpen: Cool-down elapsed, the next outcome decides (success closes,
//!   failure re-opens)
//!
//! Transitions out of Open happen lazily, on the next call to
//! [`CircuitBreaker::is_open`] or a `record_*` method.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Failures within `window` that trip the circuit
    pub failure_threshold: u32,
    /// Trailing window for counting failures, also the open cool-down
    pub window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, window: Duration) -> Self {
        Self { failure_threshold: failure_threshold.max(1), window }
    }

    /// Aggressive config for upstreams that must not be hammered
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(120),
        }
    }

    /// Lenient config for cheap, mostly-healthy backends
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            window: Duration::from_secs(30),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            window: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    failures: VecDeque<Instant>,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                failures: VecDeque::new(),
                state: CircuitState::Closed,
                opened_at: None,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Move Open to HalfOpen once the cool-down has elapsed.
    fn advance(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.window);
        if cooled {
            inner.state = CircuitState::HalfOpen;
            info!(circuit = %self.name, "Circuit cool-down elapsed, allowing trial call");
            crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        warn!(
            circuit = %self.name,
            failures = inner.failures.len(),
            window_secs = self.config.window.as_secs_f64(),
            "Circuit opened"
        );
        crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
    }

    /// Whether calls should be rejected right now.
    ///
    /// Returns `false` once the cool-down has elapsed (HalfOpen) so a trial
    /// call can go through.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, Instant::now());
        inner.state == CircuitState::Open
    }

    /// Record a failed upstream call.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.advance(&mut inner, now);

        inner.prune(now, self.config.window);
        inner.failures.push_back(now);

        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner, now),
            CircuitState::Closed if inner.failures.len() >= self.config.failure_threshold as usize => {
                self.trip(&mut inner, now)
            }
            _ => debug!(circuit = %self.name, failures = inner.failures.len(), "Circuit failure recorded"),
        }
    }

    /// Record a successful upstream call.
    ///
    /// Clears the failure count and closes the circuit unless it is still
    /// within its open cool-down.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        self.advance(&mut inner, Instant::now());

        if inner.state == CircuitState::Open {
            return;
        }
        inner.failures.clear();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!(circuit = %self.name, "Circuit closed after successful trial call");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        }
    }

    /// Get current circuit state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    /// Failures currently counted within the window
    #[must_use]
    pub fn failure_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.window);
        inner.failures.len()
    }

    #[must_use]
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        if self.is_open() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Record a rejection observed outside of [`call`](Self::call).
    pub fn note_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "rejected");
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}
