// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic status-engine usage example.
//!
//! Demonstrates:
//! 1. Starting the engine on the in-memory cache (or Redis via `REDIS_URL`)
//! 2. Monitoring three simulated services, one of them flaky
//! 3. Streaming change events as SSE frames
//! 4. A cached, coalesced fetch from request-handler code
//! 5. Displaying health and metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//!
//! # Against Redis
//! docker run -d -p 6379:6379 redis:7-alpine
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};
use status_engine::broadcast::sse;
use status_engine::scheduler::source_fn;
use status_engine::{BoxError, EngineState, MonitoredResource, ServiceKind, StatusEngine, StatusEngineConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the engine emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("status_engine=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          status-engine: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring status-engine...");

    let config = StatusEngineConfig {
        // Shared cache when available, in-memory otherwise
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: Some("status:".into()),
        // Short TTLs so the demo shows refreshes
        fresh_ttl_secs: 2,
        stale_ttl_secs: 60,
        near_expiry_secs: 1,
        refresh_interval_secs: 1,
        // Trip the flaky service's breaker quickly
        failure_threshold: 2,
        retry_max_attempts: 2,
        retry_initial_delay_ms: 50,
        ..Default::default()
    };

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let engine = Arc::new(StatusEngine::connect(config, config_rx).await?);
    assert_eq!(engine.state(), EngineState::Ready);
    println!("   ✅ Engine ready! Cache: {}", engine.health_check().cache_backend);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Monitor simulated upstreams
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛰️  Monitoring services...");

    let radarr_queue = Arc::new(AtomicUsize::new(0));
    engine.monitor(MonitoredResource::new(
        "radarr:queue",
        ServiceKind::Radarr,
        source_fn(move |_token| {
            // Grows by one item every other call
            let n = radarr_queue.fetch_add(1, Ordering::Relaxed) / 2;
            async move { Ok(json!({ "records": (0..n).collect::<Vec<_>>() })) }
        }),
    ));
    engine.monitor(MonitoredResource::new(
        "plex:sessions",
        ServiceKind::Plex,
        source_fn(|_token| async { Ok(json!({ "streams": 2, "bandwidth_kbps": 18000 })) }),
    ));
    engine.monitor(MonitoredResource::new(
        "deluge:torrents",
        ServiceKind::Deluge,
        source_fn(|_token| async { Err::<Value, BoxError>("connection refused".into()) }),
    ));
    for key in engine.monitored() {
        println!("   └─ {key}");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Stream events as SSE frames
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📡 Streaming events for 5 seconds...\n");
    let mut events = engine.register()?;
    let runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(event) => print!("{}", sse::encode(&event)?),
                None => break,
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Request-handler style fetch (served from cache)
    // ─────────────────────────────────────────────────────────────────────────
    println!("🔍 Fetching plex:sessions from a request handler...");
    let start = std::time::Instant::now();
    let fetched = engine
        .fetch_with_cache::<Value, _, _, _>(ServiceKind::Plex, &CancellationToken::new(), "plex:sessions", |_| async {
            Ok::<_, BoxError>(json!({ "streams": 0 }))
        })
        .await?;
    println!("   └─ source={} value={} ({:?})", fetched.source, fetched.value, start.elapsed());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check();
    println!("\n🩺 Health:");
    println!("   ├─ State: {}", health.state);
    println!("   ├─ Healthy: {}", health.healthy);
    println!("   ├─ Subscribers: {}", health.subscribers);
    println!("   └─ Open circuits: {:?}", health.open_circuits);

    let stats = engine.hub().stats();
    println!("\n📊 Hub: delivered={} dropped={} evicted={}", stats.delivered, stats.dropped, stats.evicted);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await?;
    runner.await??;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
