// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for status-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `status_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: memory, redis, read_through
//! - `circuit` / `upstream`: breaker name (usually the service tag)
//! - `outcome` / `source` / `status`: what happened

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Lookups and expiry
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup (`hit`, `miss`, `error`)
pub fn record_cache_lookup(backend: &str, outcome: &str) {
    counter!(
        "status_engine_cache_lookups_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record expired entries removed by a purge pass
pub fn record_cache_purged(count: usize) {
    counter!("status_engine_cache_purged_total").increment(count as u64);
}

/// Record a backend connection error
pub fn record_connection_error(backend: &str) {
    counter!(
        "status_engine_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKERS
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state (0 = Closed, 1 = HalfOpen, 2 = Open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "status_engine_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call (`success`, `failure`, `rejected`)
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "status_engine_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// FETCH - Orchestrator outcomes and upstream calls
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed fetch by where the value came from, or the error kind
pub fn record_fetch(upstream: &str, source: &str) {
    counter!(
        "status_engine_fetches_total",
        "upstream" => upstream.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record an upstream call outcome (`success`, `failure`, `cancelled`)
pub fn record_upstream_call(upstream: &str, outcome: &str) {
    counter!(
        "status_engine_upstream_calls_total",
        "upstream" => upstream.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record upstream call latency, retries included
pub fn record_upstream_latency(upstream: &str, duration: Duration) {
    histogram!(
        "status_engine_upstream_seconds",
        "upstream" => upstream.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a caller that joined an in-flight fetch instead of starting one
pub fn record_coalesced() {
    counter!("status_engine_coalesced_total").increment(1);
}

/// Record a background refresh (`ok`, `error`, `skipped`)
pub fn record_background_refresh(outcome: &str) {
    counter!(
        "status_engine_background_refreshes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CHANGE DETECTION
// ═══════════════════════════════════════════════════════════════════════════

/// Record a detected change by kind
pub fn record_change(kind: &str) {
    counter!(
        "status_engine_changes_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BROADCAST - Subscribers and fan-out
// ═══════════════════════════════════════════════════════════════════════════

/// Set current subscriber count
pub fn set_subscribers(count: usize) {
    gauge!("status_engine_subscribers").set(count as f64);
}

/// Record fan-out results of one publish
pub fn record_publish(delivered: usize, deferred: usize, dropped: usize) {
    if delivered > 0 {
        counter!("status_engine_events_delivered_total").increment(delivered as u64);
    }
    if deferred > 0 {
        counter!("status_engine_events_deferred_total").increment(deferred as u64);
    }
    if dropped > 0 {
        counter!("status_engine_events_dropped_total").increment(dropped as u64);
    }
}

/// Record a subscriber removal by reason
pub fn record_subscriber_evicted(reason: &str) {
    counter!(
        "status_engine_subscribers_evicted_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER & LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a refresh cycle's duration and results
pub fn record_refresh_cycle(duration: Duration, changed: usize, failed: usize) {
    histogram!("status_engine_refresh_cycle_seconds").record(duration.as_secs_f64());
    counter!("status_engine_refresh_cycles_total").increment(1);
    counter!("status_engine_refresh_changed_total").increment(changed as u64);
    counter!("status_engine_refresh_failed_total").increment(failed as u64);
}

/// Record a startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "status_engine_startup_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "status_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records a startup phase on drop
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        record_startup_phase(self.phase, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without an installed recorder.

    #[test]
    fn test_cache_metrics() {
        record_cache_lookup("memory", "hit");
        record_cache_lookup("redis", "miss");
        record_cache_purged(12);
        record_connection_error("redis");
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        set_circuit_state("radarr", 0);
        set_circuit_state("sonarr", 2);
        record_circuit_call("radarr", "success");
        record_circuit_call("sonarr", "rejected");
    }

    #[test]
    fn test_fetch_metrics() {
        record_fetch("plex", "cache");
        record_fetch("plex", "unavailable");
        record_upstream_call("plex", "failure");
        record_upstream_latency("plex", Duration::from_millis(40));
        record_coalesced();
        record_background_refresh("skipped");
    }

    #[test]
    fn test_broadcast_metrics() {
        set_subscribers(3);
        record_publish(3, 1, 0);
        record_publish(0, 0, 0);
        record_subscriber_evicted("max_age");
        record_change("added");
    }

    #[test]
    fn test_phase_timer() {
        {
            let _timer = PhaseTimer::new("connect");
            std::thread::sleep(Duration::from_micros(10));
        }
        record_refresh_cycle(Duration::from_millis(250), 2, 1);
        set_engine_state("Running");
    }
}
