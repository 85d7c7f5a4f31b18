//! # Materialization Metrics
//!
//! Lock-free counters for the ingestion, compaction and bulk-load paths.
//!
//! Every recording call is also emitted through the `metrics` crate facade,
//! so a host that installs a recorder (e.g. metrics-exporter-prometheus)
//! gets `rivven_materialize_*` series for free.
//!
//! ```ignore
//! let metrics = MaterializeMetrics::new();
//! metrics.record_merged("titles", 1);
//! assert_eq!(metrics.snapshot().events_merged, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Materialization metrics collector.
#[derive(Debug, Default)]
pub struct MaterializeMetrics {
    events_merged: AtomicU64,
    events_dropped: AtomicU64,
    field_defaults: AtomicU64,
    versions_compacted: AtomicU64,
    compaction_failures: AtomicU64,
    compaction_passes: AtomicU64,
    chunks_loaded: AtomicU64,
    chunks_drained: AtomicU64,
    chunks_timed_out: AtomicU64,
    drain_wait_ms: AtomicU64,
}

impl MaterializeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record versions merged into the store.
    pub fn record_merged(&self, entity: &str, count: u64) {
        self.events_merged.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_materialize_events_merged_total",
            "entity" => entity.to_string()
        )
        .increment(count);
    }

    /// Record an event dropped on the ingestion path.
    pub fn record_dropped(&self, entity: &str, error_code: &'static str) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_materialize_events_dropped_total",
            "entity" => entity.to_string(),
            "reason" => error_code
        )
        .increment(1);
    }

    /// Record optional fields that fell back to their default.
    pub fn record_field_defaults(&self, entity: &str, count: u64) {
        self.field_defaults.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_materialize_field_defaults_total",
            "entity" => entity.to_string()
        )
        .increment(count);
    }

    /// Record a finished compaction pass.
    pub fn record_compaction_pass(&self, removed: u64, failures: u64, duration: Duration) {
        self.compaction_passes.fetch_add(1, Ordering::Relaxed);
        self.versions_compacted.fetch_add(removed, Ordering::Relaxed);
        self.compaction_failures
            .fetch_add(failures, Ordering::Relaxed);

        metrics::counter!("rivven_materialize_versions_compacted_total").increment(removed);
        metrics::counter!("rivven_materialize_compaction_failures_total").increment(failures);
        metrics::histogram!("rivven_materialize_compaction_duration_seconds")
            .record(duration.as_secs_f64());
    }

    /// Record a loaded chunk and how its drain wait ended.
    pub fn record_chunk(&self, stream: &str, drained: bool, timed_out: bool, waited: Duration) {
        self.chunks_loaded.fetch_add(1, Ordering::Relaxed);
        if drained {
            self.chunks_drained.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.chunks_timed_out.fetch_add(1, Ordering::Relaxed);
        }
        self.drain_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);

        metrics::counter!(
            "rivven_materialize_chunks_loaded_total",
            "stream" => stream.to_string()
        )
        .increment(1);
        if timed_out {
            metrics::counter!(
                "rivven_materialize_chunks_timed_out_total",
                "stream" => stream.to_string()
            )
            .increment(1);
        }
        metrics::histogram!(
            "rivven_materialize_drain_wait_seconds",
            "stream" => stream.to_string()
        )
        .record(waited.as_secs_f64());
    }

    /// Record the latest observed transport lag.
    pub fn record_lag(&self, stream: &str, lag: u64) {
        metrics::gauge!(
            "rivven_materialize_transport_lag",
            "stream" => stream.to_string()
        )
        .set(lag as f64);
    }

    /// Get a point-in-time snapshot.
    pub fn snapshot(&self) -> MaterializeMetricsSnapshot {
        MaterializeMetricsSnapshot {
            events_merged: self.events_merged.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            field_defaults: self.field_defaults.load(Ordering::Relaxed),
            versions_compacted: self.versions_compacted.load(Ordering::Relaxed),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            compaction_passes: self.compaction_passes.load(Ordering::Relaxed),
            chunks_loaded: self.chunks_loaded.load(Ordering::Relaxed),
            chunks_drained: self.chunks_drained.load(Ordering::Relaxed),
            chunks_timed_out: self.chunks_timed_out.load(Ordering::Relaxed),
            drain_wait_ms: self.drain_wait_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of materialization metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeMetricsSnapshot {
    pub events_merged: u64,
    pub events_dropped: u64,
    pub field_defaults: u64,
    pub versions_compacted: u64,
    pub compaction_failures: u64,
    pub compaction_passes: u64,
    pub chunks_loaded: u64,
    pub chunks_drained: u64,
    pub chunks_timed_out: u64,
    pub drain_wait_ms: u64,
}

impl MaterializeMetricsSnapshot {
    /// Fraction of ingested events that were dropped.
    pub fn drop_rate(&self) -> f64 {
        let total = self.events_merged + self.events_dropped;
        if total == 0 {
            0.0
        } else {
            self.events_dropped as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MaterializeMetrics::new();
        metrics.record_merged("titles", 3);
        metrics.record_dropped("titles", "missing_key");
        metrics.record_field_defaults("titles", 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_merged, 3);
        assert_eq!(snapshot.events_dropped, 1);
        assert_eq!(snapshot.field_defaults, 2);
        assert!((snapshot.drop_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_chunk_accounting() {
        let metrics = MaterializeMetrics::new();
        metrics.record_chunk("titles", true, false, Duration::from_millis(20));
        metrics.record_chunk("titles", false, true, Duration::from_millis(30));
        metrics.record_chunk("titles", false, false, Duration::ZERO);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_loaded, 3);
        assert_eq!(snapshot.chunks_drained, 1);
        assert_eq!(snapshot.chunks_timed_out, 1);
        assert_eq!(snapshot.drain_wait_ms, 50);
    }

    #[test]
    fn test_compaction_accounting() {
        let metrics = MaterializeMetrics::new();
        metrics.record_compaction_pass(10, 1, Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.compaction_passes, 1);
        assert_eq!(snapshot.versions_compacted, 10);
        assert_eq!(snapshot.compaction_failures, 1);
    }

    #[test]
    fn test_empty_drop_rate() {
        assert_eq!(MaterializeMetricsSnapshot::default().drop_rate(), 0.0);
    }
}
