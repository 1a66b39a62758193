//! Metrics collector (C9): hit/miss counters per data class, operation
//! counters, latency tracking and threshold-triggered warnings.
//!
//! Generalizes a `stats: Arc<DashMap<String, u64>>` plus `hit_rate()` pattern
//! from a single aggregate counter pair to a per-[`DataClass`] breakdown,
//! widened with latency, error and memory tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::key::DataClass;

const HIT_RATE_WARNING_THRESHOLD: f64 = 0.70;
const HIT_RATE_WARNING_MIN_OPS: u64 = 1000;
const MEMORY_WARNING_BYTES: u64 = 1024 * 1024 * 1024;
const ERROR_RATE_WARNING_THRESHOLD: f64 = 0.05;
const AVG_LATENCY_WARNING_MICROS: u64 = 10_000;

fn class_label(class: DataClass) -> &'static str {
    match class {
        DataClass::ValidatorMetadata => "validator",
        DataClass::ValidatorSnapshot => "snapshot",
        DataClass::Performance => "performance",
        DataClass::NetworkStats => "network_stats",
        DataClass::Alerts => "alert",
        DataClass::HeadEvent => "head_event",
    }
}

#[derive(Debug, Default)]
struct ClassCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time snapshot of collected metrics, suitable for scraping by a
/// dashboard or an external exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits_by_class: std::collections::HashMap<String, u64>,
    pub misses_by_class: std::collections::HashMap<String, u64>,
    pub hit_rate: f64,
    pub get_count: u64,
    pub set_count: u64,
    pub delete_count: u64,
    pub total_latency_micros: u64,
    pub avg_latency_micros: f64,
    pub error_count: u64,
    pub errors_by_class: std::collections::HashMap<String, u64>,
    pub memory_used_bytes: u64,
    pub memory_peak_bytes: u64,
    pub uptime_seconds: u64,
    pub warnings: Vec<String>,
}

/// Collects cache/operation metrics. Cheap to clone (internally `Arc`-backed
/// counters); intended to be constructed once and shared across the cache,
/// loader and invalidation bus.
pub struct MetricsCollector {
    classes: DashMap<&'static str, ClassCounters>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    delete_count: AtomicU64,
    total_latency_micros: AtomicU64,
    latency_samples: AtomicU64,
    error_count: AtomicU64,
    errors_by_class: DashMap<&'static str, AtomicU64>,
    memory_used_bytes: AtomicU64,
    memory_peak_bytes: AtomicU64,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: DashMap::new(),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(0),
            total_latency_micros: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            errors_by_class: DashMap::new(),
            memory_used_bytes: AtomicU64::new(0),
            memory_peak_bytes: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn record_hit(&self, class: DataClass) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.classes
            .entry(class_label(class))
            .or_default()
            .hits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, class: DataClass) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.classes
            .entry(class_label(class))
            .or_default()
            .misses
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.set_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.delete_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, class: DataClass) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.errors_by_class
            .entry(class_label(class))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, elapsed: Duration) {
        self.total_latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_memory_used(&self, bytes: u64) {
        self.memory_used_bytes.store(bytes, Ordering::Relaxed);
        self.memory_peak_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    fn total_hits(&self) -> u64 {
        self.classes.iter().map(|e| e.hits.load(Ordering::Relaxed)).sum()
    }

    fn total_misses(&self) -> u64 {
        self.classes.iter().map(|e| e.misses.load(Ordering::Relaxed)).sum()
    }

    /// Overall hit rate across every data class, `0.0` when no gets recorded.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.total_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn error_rate(&self) -> f64 {
        let ops = self.get_count.load(Ordering::Relaxed)
            + self.set_count.load(Ordering::Relaxed)
            + self.delete_count.load(Ordering::Relaxed);
        if ops == 0 {
            0.0
        } else {
            self.error_count.load(Ordering::Relaxed) as f64 / ops as f64
        }
    }

    fn avg_latency_micros(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            0.0
        } else {
            self.total_latency_micros.load(Ordering::Relaxed) as f64 / samples as f64
        }
    }

    /// Builds the current snapshot, including any threshold warnings that
    /// currently hold.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits_by_class = self
            .classes
            .iter()
            .map(|e| (e.key().to_string(), e.hits.load(Ordering::Relaxed)))
            .collect();
        let misses_by_class = self
            .classes
            .iter()
            .map(|e| (e.key().to_string(), e.misses.load(Ordering::Relaxed)))
            .collect();
        let errors_by_class = self
            .errors_by_class
            .iter()
            .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
            .collect();

        let hit_rate = self.hit_rate();
        let avg_latency_micros = self.avg_latency_micros();
        let total_ops = self.total_hits() + self.total_misses();
        let memory_used_bytes = self.memory_used_bytes.load(Ordering::Relaxed);

        let mut warnings = Vec::new();
        if total_ops >= HIT_RATE_WARNING_MIN_OPS && hit_rate < HIT_RATE_WARNING_THRESHOLD {
            warnings.push(format!(
                "hit rate {:.1}% below {:.0}% threshold over {total_ops} ops",
                hit_rate * 100.0,
                HIT_RATE_WARNING_THRESHOLD * 100.0
            ));
        }
        if memory_used_bytes > MEMORY_WARNING_BYTES {
            warnings.push(format!("memory used {memory_used_bytes} bytes exceeds 1GiB"));
        }
        if self.error_rate() > ERROR_RATE_WARNING_THRESHOLD {
            warnings.push(format!("error rate {:.1}% exceeds 5%", self.error_rate() * 100.0));
        }
        if avg_latency_micros > AVG_LATENCY_WARNING_MICROS as f64 {
            warnings.push(format!("average latency {avg_latency_micros:.0}us exceeds 10ms"));
        }

        MetricsSnapshot {
            hits_by_class,
            misses_by_class,
            hit_rate,
            get_count: self.get_count.load(Ordering::Relaxed),
            set_count: self.set_count.load(Ordering::Relaxed),
            delete_count: self.delete_count.load(Ordering::Relaxed),
            total_latency_micros: self.total_latency_micros.load(Ordering::Relaxed),
            avg_latency_micros,
            error_count: self.error_count.load(Ordering::Relaxed),
            errors_by_class,
            memory_used_bytes,
            memory_peak_bytes: self.memory_peak_bytes.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_with_no_ops() {
        let m = MetricsCollector::new();
        assert_eq!(m.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_recorded_hits_and_misses() {
        let m = MetricsCollector::new();
        m.record_hit(DataClass::ValidatorMetadata);
        m.record_hit(DataClass::ValidatorMetadata);
        m.record_miss(DataClass::ValidatorMetadata);
        assert!((m.hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn low_hit_rate_warning_only_fires_past_minimum_ops() {
        let m = MetricsCollector::new();
        for _ in 0..10 {
            m.record_miss(DataClass::Alerts);
        }
        assert!(m.snapshot().warnings.is_empty());
    }

    #[test]
    fn low_hit_rate_warning_fires_past_threshold_ops() {
        let m = MetricsCollector::new();
        for _ in 0..HIT_RATE_WARNING_MIN_OPS {
            m.record_miss(DataClass::Alerts);
        }
        let snap = m.snapshot();
        assert!(snap.warnings.iter().any(|w| w.contains("hit rate")));
    }

    #[test]
    fn memory_peak_tracks_high_watermark() {
        let m = MetricsCollector::new();
        m.set_memory_used(100);
        m.set_memory_used(50);
        assert_eq!(m.snapshot().memory_peak_bytes, 100);
        assert_eq!(m.snapshot().memory_used_bytes, 50);
    }
}
