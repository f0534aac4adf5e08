//! Process counters and write-latency tracking.
//!
//! The scheduler consults [`MonitorMetrics::write_p95_ms`] against the
//! configured watermarks to drive ingest backpressure; everything else is
//! plain counters surfaced through logs and the websocket stats frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// Latency samples older than this fall out of the p95 window.
const LATENCY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub feed_overlaps: u64,
    pub ingest_shedding: u64,
    pub training_failures: u64,
    pub frames_produced: u64,
    pub anomalies_emitted: u64,
    pub anomalies_suppressed: u64,
    pub slow_consumers: u64,
    pub catalog_skipped: u64,
    pub store_retries: u64,
    pub write_p95_ms: f64,
}

#[derive(Default)]
pub struct MonitorMetrics {
    feed_overlaps: AtomicU64,
    ingest_shedding: AtomicU64,
    training_failures: AtomicU64,
    frames_produced: AtomicU64,
    anomalies_emitted: AtomicU64,
    anomalies_suppressed: AtomicU64,
    slow_consumers: AtomicU64,
    catalog_skipped: AtomicU64,
    store_retries: AtomicU64,
    write_latencies: RwLock<VecDeque<(Instant, u64)>>,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_overlap(&self) {
        self.feed_overlaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shedding(&self) {
        self.ingest_shedding.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_training_failure(&self) {
        self.training_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames(&self, count: u64) {
        self.frames_produced.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.anomalies_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_consumers(&self, count: u64) {
        self.slow_consumers.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_catalog_skipped(&self, count: u64) {
        self.catalog_skipped.store(count, Ordering::Relaxed);
    }

    pub fn record_store_retry(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one store write's latency.
    pub fn record_write_latency(&self, elapsed: Duration) {
        let mut latencies = self.write_latencies.write();
        let now = Instant::now();
        latencies.push_back((now, elapsed.as_micros() as u64));
        while latencies
            .front()
            .map(|(t, _)| now.duration_since(*t) > LATENCY_WINDOW)
            .unwrap_or(false)
        {
            latencies.pop_front();
        }
    }

    /// p95 write latency over the trailing window, in milliseconds.
    pub fn write_p95_ms(&self) -> f64 {
        let latencies = self.write_latencies.read();
        if latencies.is_empty() {
            return 0.0;
        }
        let now = Instant::now();
        let mut sorted: Vec<u64> = latencies
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= LATENCY_WINDOW)
            .map(|(_, v)| *v)
            .collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)] as f64 / 1000.0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            feed_overlaps: self.feed_overlaps.load(Ordering::Relaxed),
            ingest_shedding: self.ingest_shedding.load(Ordering::Relaxed),
            training_failures: self.training_failures.load(Ordering::Relaxed),
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            anomalies_emitted: self.anomalies_emitted.load(Ordering::Relaxed),
            anomalies_suppressed: self.anomalies_suppressed.load(Ordering::Relaxed),
            slow_consumers: self.slow_consumers.load(Ordering::Relaxed),
            catalog_skipped: self.catalog_skipped.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            write_p95_ms: self.write_p95_ms(),
        }
    }
}
