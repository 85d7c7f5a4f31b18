//! # Version Compaction
//!
//! Reclaims space by discarding superseded versions. Only the current
//! version of a key is needed to answer `current_of`; older versions are
//! history and can be dropped once they have been superseded for longer
//! than the retention window.
//!
//! ## Features
//!
//! - **Current version is untouchable**: enforced by the store's
//!   `remove_versions`, not only by the selection here
//! - **Per-key isolation**: a failing key is logged and retried next pass
//! - **Retention-aware**: the window comes from the [`RetentionManager`]
//!   when one is attached, otherwise from the config
//! - **Background task**: [`Compactor::spawn`] runs passes on an interval
//!
//! ## Usage
//!
//! ```ignore
//! let config = CompactionConfig::builder()
//!     .superseded_retention(Duration::from_secs(3600))
//!     .interval(Duration::from_secs(300))
//!     .build();
//!
//! let compactor = Arc::new(Compactor::new(store.clone(), config));
//! let handle = compactor.clone().spawn();
//! // ...
//! compactor.shutdown();
//! handle.await?;
//! ```

use crate::error::{MaterializeError, Result};
use crate::event::RecordKey;
use crate::metrics::MaterializeMetrics;
use crate::record::{current_index, VersionedRecord};
use crate::retention::RetentionManager;
use crate::store::VersionStore;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for version compaction.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// How long a superseded version is kept
    pub superseded_retention: Duration,
    /// Time between background passes
    pub interval: Duration,
    /// Skip keys with no more than this many versions
    pub min_versions: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            superseded_retention: Duration::from_secs(86400), // 24 hours
            interval: Duration::from_secs(300),
            min_versions: 1,
        }
    }
}

impl CompactionConfig {
    pub fn builder() -> CompactionConfigBuilder {
        CompactionConfigBuilder::default()
    }

    /// Aggressive compaction preset.
    pub fn aggressive() -> Self {
        Self {
            superseded_retention: Duration::ZERO,
            interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Conservative compaction preset.
    pub fn conservative() -> Self {
        Self {
            superseded_retention: Duration::from_secs(604800), // 7 days
            interval: Duration::from_secs(3600),
            min_versions: 4,
            ..Default::default()
        }
    }
}

/// Builder for CompactionConfig.
#[derive(Default)]
pub struct CompactionConfigBuilder {
    config: CompactionConfig,
}

impl CompactionConfigBuilder {
    pub fn superseded_retention(mut self, retention: Duration) -> Self {
        self.config.superseded_retention = retention;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn min_versions(mut self, min: usize) -> Self {
        self.config.min_versions = min.max(1);
        self
    }

    pub fn build(self) -> CompactionConfig {
        self.config
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default)]
pub struct CompactionPassResult {
    pub keys_scanned: usize,
    pub keys_compacted: usize,
    pub versions_removed: usize,
    /// Keys left as they were, with the reason
    pub failed: Vec<(RecordKey, String)>,
    pub duration: Duration,
}

impl CompactionPassResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cumulative compaction statistics.
#[derive(Debug, Default)]
pub struct CompactionStats {
    passes: AtomicU64,
    versions_removed: AtomicU64,
    key_failures: AtomicU64,
    last_pass_ms: AtomicU64,
}

impl CompactionStats {
    fn record_pass(&self, result: &CompactionPassResult) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.versions_removed
            .fetch_add(result.versions_removed as u64, Ordering::Relaxed);
        self.key_failures
            .fetch_add(result.failed.len() as u64, Ordering::Relaxed);
        self.last_pass_ms
            .store(result.duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn versions_removed(&self) -> u64 {
        self.versions_removed.load(Ordering::Relaxed)
    }

    pub fn key_failures(&self) -> u64 {
        self.key_failures.load(Ordering::Relaxed)
    }

    pub fn last_pass_duration(&self) -> Duration {
        Duration::from_millis(self.last_pass_ms.load(Ordering::Relaxed))
    }
}

/// Indices of versions that have been superseded for at least `window`.
///
/// A version counts as superseded from the earliest ingest time of any
/// version ordered above it. The current version is never selected.
pub fn expired_superseded(
    versions: &[VersionedRecord],
    window: Duration,
    now_ms: i64,
) -> Vec<usize> {
    let Some(current) = current_index(versions) else {
        return Vec::new();
    };
    // Windows beyond i64 millis never elapse
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

    versions
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != current)
        .filter_map(|(i, version)| {
            let superseded_at = versions
                .iter()
                .filter(|other| other.supersedes(version))
                .map(|other| other.ingest_ts_ms)
                .min()?;
            (now_ms.saturating_sub(superseded_at) >= window_ms).then_some(i)
        })
        .collect()
}

/// Compactor over a version store.
pub struct Compactor<S: VersionStore> {
    store: Arc<S>,
    config: CompactionConfig,
    retention: Option<Arc<RetentionManager>>,
    metrics: Option<Arc<MaterializeMetrics>>,
    stats: CompactionStats,
    shutdown: Notify,
}

impl<S: VersionStore + 'static> Compactor<S> {
    pub fn new(store: Arc<S>, config: CompactionConfig) -> Self {
        Self {
            store,
            config,
            retention: None,
            metrics: None,
            stats: CompactionStats::default(),
            shutdown: Notify::new(),
        }
    }

    /// Take superseded-version windows from a retention manager.
    pub fn with_retention(mut self, retention: Arc<RetentionManager>) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MaterializeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// Retention window for superseded versions of an entity.
    pub fn window_for(&self, entity: &str) -> Duration {
        self.window_at(entity, Utc::now().timestamp_millis())
    }

    /// Window as of `now_ms`: the stream's retention policy in effect at
    /// that time, else the configured default.
    pub fn window_at(&self, entity: &str, now_ms: i64) -> Duration {
        self.retention
            .as_ref()
            .and_then(|retention| retention.policy_in_effect(entity, now_ms))
            .map(|policy| policy.retention())
            .unwrap_or(self.config.superseded_retention)
    }

    /// Compact one key as of now.
    pub fn compact(&self, key: &RecordKey) -> Result<usize> {
        self.compact_at(key, Utc::now().timestamp_millis())
    }

    /// Compact one key as of `now_ms`. Returns the number of versions removed.
    pub fn compact_at(&self, key: &RecordKey, now_ms: i64) -> Result<usize> {
        let window = self.window_at(&key.entity, now_ms);
        let removed = self
            .store
            .remove_versions(key, &|versions| expired_superseded(versions, window, now_ms))
            .map_err(|e| match e {
                MaterializeError::StoreUnavailable(_) | MaterializeError::Compaction { .. } => e,
                other => MaterializeError::compaction(key, other.to_string()),
            })?;

        if removed > 0 {
            debug!(key = %key, removed, "Compacted superseded versions");
        }
        Ok(removed)
    }

    /// Compact every key once.
    pub fn run_pass(&self) -> Result<CompactionPassResult> {
        self.run_pass_at(Utc::now().timestamp_millis())
    }

    /// Compact every key once as of `now_ms`.
    ///
    /// A failing key is recorded and skipped. Only a fatal store error ends
    /// the pass early.
    pub fn run_pass_at(&self, now_ms: i64) -> Result<CompactionPassResult> {
        let start = Instant::now();
        let mut result = CompactionPassResult::default();

        for key in self.store.keys()? {
            result.keys_scanned += 1;

            if self.config.min_versions > 1 {
                match self.store.all_versions_of(&key) {
                    Ok(versions) if versions.len() <= self.config.min_versions => continue,
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Compaction failed for key");
                        result.failed.push((key, e.to_string()));
                        continue;
                    }
                }
            }

            match self.compact_at(&key, now_ms) {
                Ok(0) => {}
                Ok(removed) => {
                    result.keys_compacted += 1;
                    result.versions_removed += removed;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(key = %key, error = %e, "Compaction failed for key");
                    result.failed.push((key, e.to_string()));
                }
            }
        }

        result.duration = start.elapsed();
        self.stats.record_pass(&result);
        if let Some(metrics) = &self.metrics {
            metrics.record_compaction_pass(
                result.versions_removed as u64,
                result.failed.len() as u64,
                result.duration,
            );
        }

        info!(
            keys_scanned = result.keys_scanned,
            keys_compacted = result.keys_compacted,
            versions_removed = result.versions_removed,
            failed = result.failed.len(),
            duration_ms = result.duration.as_millis() as u64,
            "Compaction pass complete"
        );
        Ok(result)
    }

    /// Run passes every `interval` until [`Compactor::shutdown`].
    ///
    /// Passes run on the blocking pool so ingestion is never starved. The
    /// task exits on its own if the store becomes unavailable.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.config.interval.as_millis() as u64, "Compactor started");

            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("Compactor received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.interval) => {
                        let compactor = self.clone();
                        match tokio::task::spawn_blocking(move || compactor.run_pass()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) if e.is_fatal() => {
                                error!(error = %e, "Compactor stopping: store unavailable");
                                break;
                            }
                            Ok(Err(e)) => warn!(error = %e, "Compaction pass failed"),
                            Err(e) => error!(error = %e, "Compaction pass panicked"),
                        }
                    }
                }
            }

            info!("Compactor stopped");
        })
    }

    /// Stop the background task after its current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeOp;
    use crate::retention::RetentionPolicy;
    use crate::schema::Fields;
    use crate::store::MemoryVersionStore;

    fn version(id: &str, ts: i64, seq: u64, ingest: i64) -> VersionedRecord {
        VersionedRecord {
            key: RecordKey::new("titles", id),
            payload: Fields::new(),
            operation: ChangeOp::Update,
            event_ts_ms: ts,
            sequence: seq,
            is_deleted: false,
            ingest_ts_ms: ingest,
        }
    }

    fn store_with_history() -> Arc<MemoryVersionStore> {
        let store = Arc::new(MemoryVersionStore::new());
        store.merge(version("k1", 100, 1, 1_000)).unwrap();
        store.merge(version("k1", 105, 2, 2_000)).unwrap();
        store.merge(version("k1", 110, 3, 3_000)).unwrap();
        store
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(CompactionConfig::aggressive().superseded_retention, Duration::ZERO);
        assert_eq!(CompactionConfig::conservative().min_versions, 4);

        let config = CompactionConfig::builder()
            .superseded_retention(Duration::from_secs(5))
            .min_versions(0)
            .build();
        assert_eq!(config.superseded_retention, Duration::from_secs(5));
        assert_eq!(config.min_versions, 1);
    }

    #[test]
    fn test_expired_superseded_respects_window() {
        let versions = vec![
            version("k1", 100, 1, 1_000),
            version("k1", 105, 2, 2_000),
            version("k1", 110, 3, 3_000),
        ];
        // v0 superseded at 2000, v1 at 3000
        assert_eq!(expired_superseded(&versions, Duration::from_secs(1), 3_500), vec![0]);
        assert_eq!(expired_superseded(&versions, Duration::from_secs(1), 4_000), vec![0, 1]);
        assert!(expired_superseded(&versions, Duration::from_secs(10), 4_000).is_empty());
    }

    #[test]
    fn test_late_arrival_supersedes_from_its_ingest_time() {
        // Newer version arrives after an older one
        let versions = vec![version("k1", 110, 2, 5_000), version("k1", 100, 1, 9_000)];
        // Superseding version was already stored
        assert_eq!(expired_superseded(&versions, Duration::ZERO, 9_000), vec![1]);
    }

    #[test]
    fn test_compact_keeps_only_current() {
        let store = store_with_history();
        let compactor = Compactor::new(store.clone(), CompactionConfig::aggressive());
        let key = RecordKey::new("titles", "k1");

        assert_eq!(compactor.compact(&key).unwrap(), 2);
        let remaining = store.all_versions_of(&key).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_ts_ms, 110);

        // Nothing left to do
        assert_eq!(compactor.compact(&key).unwrap(), 0);
    }

    #[test]
    fn test_compact_waits_for_window() {
        let store = store_with_history();
        let compactor = Compactor::new(
            store.clone(),
            CompactionConfig::builder()
                .superseded_retention(Duration::from_secs(60))
                .build(),
        );
        let key = RecordKey::new("titles", "k1");

        assert_eq!(compactor.compact_at(&key, 10_000).unwrap(), 0);
        assert_eq!(compactor.compact_at(&key, 63_000).unwrap(), 2);
    }

    #[test]
    fn test_retention_manager_overrides_window() {
        let store = store_with_history();
        let retention = Arc::new(RetentionManager::default());
        retention.set_policy_at("titles", RetentionPolicy::from_duration(Duration::ZERO), 0);

        let compactor = Compactor::new(store, CompactionConfig::conservative())
            .with_retention(retention);
        assert_eq!(compactor.window_for("titles"), Duration::ZERO);
        assert_eq!(compactor.window_for("people"), Duration::from_secs(604800));
    }

    #[test]
    fn test_unbounded_window_keeps_history() {
        let store = Arc::new(MemoryVersionStore::new());
        store.merge(version("k1", 100, 1, 1_000)).unwrap();
        store.merge(version("k1", 105, 2, 2_000)).unwrap();
        let key = RecordKey::new("titles", "k1");

        for window in [Duration::MAX, Duration::from_millis(u64::MAX)] {
            let compactor = Compactor::new(
                store.clone(),
                CompactionConfig::builder()
                    .superseded_retention(window)
                    .build(),
            );
            assert_eq!(compactor.compact_at(&key, 2_001).unwrap(), 0);
            assert_eq!(compactor.compact_at(&key, i64::MAX).unwrap(), 0);
        }

        // Same through a retention policy
        let retention = Arc::new(RetentionManager::default());
        retention.set_policy_at("titles", RetentionPolicy::from_duration(Duration::MAX), 0);
        let compactor = Compactor::new(store.clone(), CompactionConfig::aggressive())
            .with_retention(retention);
        assert_eq!(compactor.compact_at(&key, 2_001).unwrap(), 0);
        assert_eq!(store.all_versions_of(&key).unwrap().len(), 2);
    }

    #[test]
    fn test_scheduled_retention_applies_from_effective_time() {
        let store = store_with_history();
        let retention = Arc::new(RetentionManager::default());
        let immediate = RetentionPolicy::from_duration(Duration::ZERO);
        retention.set_policy_at("titles", immediate, 50_000);

        let compactor = Compactor::new(
            store.clone(),
            CompactionConfig::builder()
                .superseded_retention(Duration::from_secs(3600))
                .build(),
        )
        .with_retention(retention);
        let key = RecordKey::new("titles", "k1");

        // Policy not yet in effect: configured hour applies
        assert_eq!(compactor.window_at("titles", 10_000), Duration::from_secs(3600));
        assert_eq!(compactor.compact_at(&key, 10_000).unwrap(), 0);
        assert_eq!(compactor.compact_at(&key, 50_000).unwrap(), 2);
    }

    struct FailingStore {
        inner: MemoryVersionStore,
        poisoned: RecordKey,
    }

    impl VersionStore for FailingStore {
        fn merge(&self, record: VersionedRecord) -> Result<()> {
            self.inner.merge(record)
        }
        fn current_of(&self, key: &RecordKey) -> Result<Option<VersionedRecord>> {
            self.inner.current_of(key)
        }
        fn all_versions_of(&self, key: &RecordKey) -> Result<Vec<VersionedRecord>> {
            self.inner.all_versions_of(key)
        }
        fn keys(&self) -> Result<Vec<RecordKey>> {
            self.inner.keys()
        }
        fn key_count(&self) -> Result<usize> {
            self.inner.key_count()
        }
        fn version_count(&self) -> Result<usize> {
            self.inner.version_count()
        }
        fn remove_versions(
            &self,
            key: &RecordKey,
            select: &dyn Fn(&[VersionedRecord]) -> Vec<usize>,
        ) -> Result<usize> {
            if key == &self.poisoned {
                return Err(MaterializeError::merge("segment locked"));
            }
            self.inner.remove_versions(key, select)
        }
        fn truncate(&self) -> Result<()> {
            self.inner.truncate()
        }
    }

    #[test]
    fn test_pass_isolates_key_failures() {
        let store = Arc::new(FailingStore {
            inner: MemoryVersionStore::new(),
            poisoned: RecordKey::new("titles", "bad"),
        });
        for id in ["a", "bad", "c"] {
            store.merge(version(id, 1, 1, 0)).unwrap();
            store.merge(version(id, 2, 2, 0)).unwrap();
        }

        let compactor = Compactor::new(store.clone(), CompactionConfig::aggressive());
        let result = compactor.run_pass_at(1_000).unwrap();

        assert_eq!(result.keys_scanned, 3);
        assert_eq!(result.keys_compacted, 2);
        assert_eq!(result.versions_removed, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, RecordKey::new("titles", "bad"));
        // Failed key keeps its versions for the next pass
        assert_eq!(store.all_versions_of(&RecordKey::new("titles", "bad")).unwrap().len(), 2);
        assert_eq!(compactor.stats().key_failures(), 1);
    }

    #[test]
    fn test_pass_stops_on_unavailable_store() {
        let store = store_with_history();
        let compactor = Compactor::new(store.clone(), CompactionConfig::aggressive());
        store.close();

        assert!(compactor.run_pass().unwrap_err().is_fatal());
    }

    #[test]
    fn test_min_versions_skips_short_histories() {
        let store = store_with_history();
        let compactor = Compactor::new(
            store,
            CompactionConfig::builder()
                .superseded_retention(Duration::ZERO)
                .min_versions(3)
                .build(),
        );
        let result = compactor.run_pass_at(10_000).unwrap();
        assert_eq!(result.keys_scanned, 1);
        assert_eq!(result.versions_removed, 0);
    }

    #[tokio::test]
    async fn test_background_task_compacts_and_stops() {
        let store = store_with_history();
        let metrics = Arc::new(MaterializeMetrics::new());
        let compactor = Arc::new(
            Compactor::new(
                store.clone(),
                CompactionConfig::builder()
                    .superseded_retention(Duration::ZERO)
                    .interval(Duration::from_millis(10))
                    .build(),
            )
            .with_metrics(metrics.clone()),
        );

        let handle = compactor.clone().spawn();
        for _ in 0..100 {
            if compactor.stats().passes() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        compactor.shutdown();
        handle.await.unwrap();

        assert_eq!(store.version_count().unwrap(), 1);
        assert!(metrics.snapshot().compaction_passes >= 1);
    }
}
