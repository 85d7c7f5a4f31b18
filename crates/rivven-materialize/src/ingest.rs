//! # Ingestion
//!
//! The single entrypoint from raw change events into the versioned store:
//! decode, stamp with ingest time, merge.
//!
//! Decode failures are recovered locally: the event is logged, counted and
//! skipped, and the stream continues. Store failures propagate; a store that
//! is gone is the one fatal condition on this path.
//!
//! [`PartitionedIngestor`] runs one worker per independently ordered
//! partition of the event stream. Events for the same key are expected to
//! arrive on the same partition; no order is assumed across partitions.
//!
//! ```text
//!  partition 0 ──► mpsc ──► worker 0 ──┐
//!  partition 1 ──► mpsc ──► worker 1 ──┼──► Ingestor ──► VersionStore
//!  partition N ──► mpsc ──► worker N ──┘
//! ```

use crate::decoder::EventDecoder;
use crate::error::{DecodeError, MaterializeError, Result};
use crate::event::{RawChangeEvent, RecordKey};
use crate::metrics::MaterializeMetrics;
use crate::record::VersionedRecord;
use crate::store::VersionStore;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of ingesting one event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stored as a new version
    Merged(RecordKey),
    /// Dropped; replaying it would fail the same way
    Skipped(DecodeError),
}

impl IngestOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged(_))
    }
}

/// Counts for a batch of events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub merged: usize,
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.merged + self.skipped
    }
}

/// Decoder plus store: the ingestion path.
pub struct Ingestor<S: VersionStore> {
    decoder: Arc<EventDecoder>,
    store: Arc<S>,
    metrics: Arc<MaterializeMetrics>,
}

impl<S: VersionStore> Ingestor<S> {
    pub fn new(decoder: EventDecoder, store: Arc<S>) -> Self {
        Self::with_metrics(decoder, store, Arc::new(MaterializeMetrics::new()))
    }

    pub fn with_metrics(
        decoder: EventDecoder,
        store: Arc<S>,
        metrics: Arc<MaterializeMetrics>,
    ) -> Self {
        Self {
            decoder: Arc::new(decoder.with_metrics(metrics.clone())),
            store,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    pub fn metrics(&self) -> &Arc<MaterializeMetrics> {
        &self.metrics
    }

    fn skip(&self, raw_entity: Option<&str>, error: DecodeError) -> IngestOutcome {
        let entity = raw_entity.unwrap_or("unknown");
        warn!(
            entity = %entity,
            error_code = error.error_code(),
            error = %error,
            "Dropping undecodable change event"
        );
        self.metrics.record_dropped(entity, error.error_code());
        IngestOutcome::Skipped(error)
    }

    /// Decode and merge one event.
    pub fn ingest(&self, raw: &RawChangeEvent) -> Result<IngestOutcome> {
        let event = match self.decoder.decode(raw) {
            Ok(event) => event,
            Err(e) => return Ok(self.skip(raw.entity_name(), e)),
        };

        let record = VersionedRecord::from_event(event, Utc::now().timestamp_millis());
        let key = record.key.clone();
        self.store.merge(record)?;
        self.metrics.record_merged(&key.entity, 1);

        Ok(IngestOutcome::Merged(key))
    }

    /// Decode and merge one JSON-encoded event.
    pub fn ingest_json(&self, bytes: &[u8]) -> Result<IngestOutcome> {
        match RawChangeEvent::from_json(bytes) {
            Ok(raw) => self.ingest(&raw),
            Err(e) => Ok(self.skip(None, e)),
        }
    }

    /// Decode a batch, then merge every decodable event.
    ///
    /// Decoding finishes before the first merge, so a decode failure never
    /// leaves part of a batch merged.
    pub fn ingest_batch<'a>(
        &self,
        raws: impl IntoIterator<Item = &'a RawChangeEvent>,
    ) -> Result<BatchOutcome> {
        let ingest_ts_ms = Utc::now().timestamp_millis();
        let mut outcome = BatchOutcome::default();
        let mut records = Vec::new();
        let mut per_entity: HashMap<String, u64> = HashMap::new();

        for raw in raws {
            match self.decoder.decode(raw) {
                Ok(event) => {
                    *per_entity.entry(event.key.entity.clone()).or_default() += 1;
                    records.push(VersionedRecord::from_event(event, ingest_ts_ms));
                }
                Err(e) => {
                    self.skip(raw.entity_name(), e);
                    outcome.skipped += 1;
                }
            }
        }

        outcome.merged = self.store.merge_batch(records)?;
        for (entity, count) in per_entity {
            self.metrics.record_merged(&entity, count);
        }

        debug!(merged = outcome.merged, skipped = outcome.skipped, "Ingested batch");
        Ok(outcome)
    }
}

/// Configuration for partitioned ingestion.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Number of partition workers
    pub partitions: usize,
    /// Buffered events per partition
    pub channel_capacity: usize,
    /// Timeout for worker shutdown
    pub shutdown_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            channel_capacity: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }
}

/// Builder for IngestConfig.
#[derive(Default)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn partitions(mut self, n: usize) -> Self {
        self.config.partitions = n.max(1);
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> IngestConfig {
        self.config
    }
}

/// Per-partition worker counters.
#[derive(Debug, Default)]
struct WorkerStats {
    merged: AtomicU64,
    skipped: AtomicU64,
}

/// Final report of one partition worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: usize,
    pub merged: u64,
    pub skipped: u64,
    /// Set when the worker stopped on a store error
    pub failure: Option<String>,
}

/// Aggregated report returned by [`PartitionedIngestor::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub partitions: Vec<PartitionReport>,
}

impl IngestReport {
    pub fn merged(&self) -> u64 {
        self.partitions.iter().map(|p| p.merged).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.partitions.iter().map(|p| p.skipped).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions.iter().filter(|p| p.failure.is_some())
    }
}

struct PartitionWorker {
    tx: Sender<RawChangeEvent>,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<Option<String>>,
}

/// One ingestion worker per partition.
pub struct PartitionedIngestor {
    config: IngestConfig,
    workers: Vec<PartitionWorker>,
}

impl PartitionedIngestor {
    /// Spawn the partition workers.
    pub fn start<S: VersionStore + 'static>(
        ingestor: Arc<Ingestor<S>>,
        config: IngestConfig,
    ) -> Self {
        let partitions = config.partitions.max(1);
        let workers = (0..partitions)
            .map(|partition| {
                let (tx, mut rx) = mpsc::channel::<RawChangeEvent>(config.channel_capacity.max(1));
                let stats = Arc::new(WorkerStats::default());
                let worker_stats = stats.clone();
                let ingestor = ingestor.clone();

                let handle = tokio::spawn(async move {
                    while let Some(raw) = rx.recv().await {
                        match ingestor.ingest(&raw) {
                            Ok(IngestOutcome::Merged(_)) => {
                                worker_stats.merged.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(IngestOutcome::Skipped(_)) => {
                                worker_stats.skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                error!(partition, error = %e, "Partition worker stopping");
                                return Some(e.to_string());
                            }
                        }
                    }
                    debug!(partition, "Partition worker drained");
                    None
                });

                PartitionWorker { tx, stats, handle }
            })
            .collect();

        info!(partitions, "Partitioned ingestion started");
        Self { config, workers }
    }

    pub fn partitions(&self) -> usize {
        self.workers.len()
    }

    /// Partition for a routing key (e.g. the transport message key).
    pub fn partition_for(&self, routing_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        hasher.finish() as usize % self.workers.len()
    }

    /// Queue an event on a partition, waiting for buffer space.
    pub async fn submit(&self, partition: usize, raw: RawChangeEvent) -> Result<()> {
        let worker = self.workers.get(partition).ok_or_else(|| {
            MaterializeError::config(format!(
                "partition {} out of range (0..{})",
                partition,
                self.workers.len()
            ))
        })?;

        worker.tx.send(raw).await.map_err(|_| {
            MaterializeError::store_unavailable(format!(
                "partition {} worker has stopped",
                partition
            ))
        })
    }

    /// Queue an event on the partition its routing key maps to.
    pub async fn submit_routed(&self, routing_key: &str, raw: RawChangeEvent) -> Result<()> {
        self.submit(self.partition_for(routing_key), raw).await
    }

    /// Close every partition, drain queued events and collect reports.
    pub async fn shutdown(self) -> IngestReport {
        let mut report = IngestReport::default();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        for (partition, worker) in self.workers.into_iter().enumerate() {
            drop(worker.tx);

            let failure = match tokio::time::timeout_at(deadline, worker.handle).await {
                Ok(Ok(failure)) => failure,
                Ok(Err(e)) => {
                    warn!(partition, error = %e, "Partition worker panicked");
                    Some(format!("worker panicked: {}", e))
                }
                Err(_) => {
                    warn!(partition, "Partition worker timed out during shutdown");
                    Some("shutdown timed out".to_string())
                }
            };

            report.partitions.push(PartitionReport {
                partition,
                merged: worker.stats.merged.load(Ordering::Relaxed),
                skipped: worker.stats.skipped.load(Ordering::Relaxed),
                failure,
            });
        }

        info!(
            merged = report.merged(),
            skipped = report.skipped(),
            "Partitioned ingestion stopped"
        );
        report
    }
}
