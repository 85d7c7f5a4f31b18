//! # Backpressure-Aware Bulk Loading
//!
//! Drives a large initial load through the normal ingestion path in bounded
//! chunks, waiting between chunks for the transport's consumer lag to drain.
//!
//! ## State machine
//!
//! ```text
//!  Idle ──► Loading(0) ──► AwaitingDrain(0) ──► Loading(1) ──► ... ──► Done
//!                               │    ▲
//!                               ▼    │ (warn and proceed)
//!                           TimedOut(i)
//!
//!  Loading / AwaitingDrain ──(token cancelled)──► Cancelled
//! ```
//!
//! A chunk is always ingested in full before cancellation is honoured, so no
//! chunk is ever left half-merged.
//!
//! Without a [`LagMonitor`] the loader degrades to plain chunking: bursts are
//! still bounded by `chunk_size`, there are just no waits.
//!
//! ## Usage
//!
//! ```ignore
//! let config = BulkLoadConfig::builder()
//!     .chunk_size(5_000)
//!     .lag_threshold(1_000)
//!     .max_wait_per_chunk(Duration::from_secs(120))
//!     .build();
//!
//! let loader = BulkLoader::new(ingestor, config).with_lag_monitor(monitor);
//! let report = loader.load_bulk("titles", records).await?;
//! if !report.finished_clean() {
//!     warn!("{} chunks timed out", report.chunks_timed_out);
//! }
//! ```

use crate::error::{MaterializeError, Result};
use crate::event::RawChangeEvent;
use crate::ingest::Ingestor;
use crate::store::VersionStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-stream outstanding-message count exposed by the transport.
///
/// Answers may be stale by the transport's observation interval.
#[async_trait]
pub trait LagMonitor: Send + Sync {
    async fn outstanding_messages(&self, stream: &str) -> Result<u64>;
}

/// Lag gauge updated by a transport adapter.
///
/// Streams that were never reported read as zero lag.
#[derive(Debug, Default)]
pub struct SharedLagGauge {
    lag: RwLock<HashMap<String, u64>>,
}

impl SharedLagGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stream: &str, lag: u64) {
        self.lag.write().insert(stream.to_string(), lag);
    }

    pub fn get(&self, stream: &str) -> u64 {
        self.lag.read().get(stream).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LagMonitor for SharedLagGauge {
    async fn outstanding_messages(&self, stream: &str) -> Result<u64> {
        Ok(self.get(stream))
    }
}

/// What to do when lag has not drained by the per-chunk deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTimeoutPolicy {
    /// Log a warning and load the next chunk
    #[default]
    WarnAndProceed,
    /// Stop the load with `DrainTimeout`
    Fail,
}

/// Configuration for bulk loading.
#[derive(Debug, Clone)]
pub struct BulkLoadConfig {
    /// Records per chunk
    pub chunk_size: usize,
    /// Proceed once lag is below this
    pub lag_threshold: u64,
    /// Longest wait for lag to drain after one chunk
    pub max_wait_per_chunk: Duration,
    /// Time between lag queries
    pub poll_interval: Duration,
    /// Behaviour when `max_wait_per_chunk` elapses
    pub timeout_policy: DrainTimeoutPolicy,
    /// Wait for drain after the last chunk too
    pub drain_after_final_chunk: bool,
}

impl Default for BulkLoadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            lag_threshold: 10_000,
            max_wait_per_chunk: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            timeout_policy: DrainTimeoutPolicy::WarnAndProceed,
            drain_after_final_chunk: true,
        }
    }
}

impl BulkLoadConfig {
    pub fn builder() -> BulkLoadConfigBuilder {
        BulkLoadConfigBuilder::default()
    }

    /// Small chunks and a low threshold for fragile consumers.
    pub fn gentle() -> Self {
        Self {
            chunk_size: 1_000,
            lag_threshold: 1_000,
            max_wait_per_chunk: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(MaterializeError::config("chunk_size must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(MaterializeError::config("poll_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for BulkLoadConfig.
#[derive(Default)]
pub struct BulkLoadConfigBuilder {
    config: BulkLoadConfig,
}

impl BulkLoadConfigBuilder {
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn lag_threshold(mut self, threshold: u64) -> Self {
        self.config.lag_threshold = threshold;
        self
    }

    pub fn max_wait_per_chunk(mut self, wait: Duration) -> Self {
        self.config.max_wait_per_chunk = wait;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn timeout_policy(mut self, policy: DrainTimeoutPolicy) -> Self {
        self.config.timeout_policy = policy;
        self
    }

    pub fn drain_after_final_chunk(mut self, enabled: bool) -> Self {
        self.config.drain_after_final_chunk = enabled;
        self
    }

    pub fn build(self) -> BulkLoadConfig {
        self.config
    }
}

/// Observable loader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading { chunk: usize },
    AwaitingDrain { chunk: usize },
    TimedOut { chunk: usize },
    Done,
    Cancelled,
}

impl LoadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// How the wait after a chunk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Lag fell below the threshold
    Drained { lag: u64, waited: Duration },
    /// Deadline passed first
    TimedOut { lag: Option<u64>, waited: Duration },
    /// No lag feedback (no monitor, or final chunk without drain)
    Unobserved,
    /// Cancelled while waiting
    Cancelled { waited: Duration },
}

impl DrainOutcome {
    pub fn waited(&self) -> Duration {
        match self {
            Self::Drained { waited, .. }
            | Self::TimedOut { waited, .. }
            | Self::Cancelled { waited } => *waited,
            Self::Unobserved => Duration::ZERO,
        }
    }
}

/// Per-chunk report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub index: usize,
    /// Records in the chunk
    pub records: usize,
    pub merged: usize,
    pub skipped: usize,
    pub ingest_elapsed: Duration,
    /// Keys in the store after the chunk was merged
    pub total_keys: usize,
    pub drain: DrainOutcome,
}

/// Result of a bulk load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub records_loaded: usize,
    pub records_skipped: usize,
    pub chunks_processed: usize,
    pub chunks_drained: usize,
    pub chunks_timed_out: usize,
    pub chunks_unobserved: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub chunks: Vec<ChunkReport>,
}

impl LoadReport {
    /// Every chunk loaded and none waited out its deadline.
    pub fn finished_clean(&self) -> bool {
        !self.cancelled && self.chunks_timed_out == 0
    }

    /// Sizes of the chunks in load order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.records).collect()
    }

    fn record(&mut self, chunk: ChunkReport) {
        self.records_loaded += chunk.merged;
        self.records_skipped += chunk.skipped;
        self.chunks_processed += 1;
        match chunk.drain {
            DrainOutcome::Drained { .. } => self.chunks_drained += 1,
            DrainOutcome::TimedOut { .. } => self.chunks_timed_out += 1,
            DrainOutcome::Unobserved => self.chunks_unobserved += 1,
            DrainOutcome::Cancelled { .. } => {}
        }
        self.chunks.push(chunk);
    }
}

/// Chunked, lag-aware bulk loader.
pub struct BulkLoader<S: VersionStore> {
    ingestor: Arc<Ingestor<S>>,
    config: BulkLoadConfig,
    monitor: Option<Arc<dyn LagMonitor>>,
    cancel: CancellationToken,
    state_tx: watch::Sender<LoadState>,
}

impl<S: VersionStore> BulkLoader<S> {
    pub fn new(ingestor: Arc<Ingestor<S>>, config: BulkLoadConfig) -> Self {
        let (state_tx, _) = watch::channel(LoadState::Idle);
        Self {
            ingestor,
            config,
            monitor: None,
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    /// Poll this monitor between chunks.
    pub fn with_lag_monitor(mut self, monitor: Arc<dyn LagMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &BulkLoadConfig {
        &self.config
    }

    /// Token that cancels the load between chunks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel after the in-flight chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Watch the loader's state.
    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LoadState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: LoadState) {
        self.state_tx.send_replace(state);
    }

    /// Load `source` into the store in chunks, throttled by the lag of
    /// `stream`.
    pub async fn load_bulk<I>(&self, stream: &str, source: I) -> Result<LoadReport>
    where
        I: IntoIterator<Item = RawChangeEvent>,
        I::IntoIter: Send,
    {
        self.config.validate()?;

        let start = Instant::now();
        let mut report = LoadReport::default();
        let mut records = source.into_iter().peekable();
        let mut index = 0usize;

        info!(
            stream = %stream,
            chunk_size = self.config.chunk_size,
            lag_threshold = self.config.lag_threshold,
            lag_feedback = self.monitor.is_some(),
            "Bulk load starting"
        );

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let chunk: Vec<RawChangeEvent> =
                records.by_ref().take(self.config.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let is_last = records.peek().is_none();

            self.set_state(LoadState::Loading { chunk: index });
            let ingest_start = Instant::now();
            let outcome = self.ingestor.ingest_batch(&chunk)?;
            let ingest_elapsed = ingest_start.elapsed();
            let total_keys = self.ingestor.store().key_count()?;

            debug!(
                chunk = index,
                records = chunk.len(),
                merged = outcome.merged,
                skipped = outcome.skipped,
                total_keys,
                elapsed_ms = ingest_elapsed.as_millis() as u64,
                "Chunk ingested"
            );

            let drain = match &self.monitor {
                Some(monitor) if !is_last || self.config.drain_after_final_chunk => {
                    self.await_drain(monitor.as_ref(), stream, index).await
                }
                _ => DrainOutcome::Unobserved,
            };

            self.ingestor.metrics().record_chunk(
                stream,
                matches!(drain, DrainOutcome::Drained { .. }),
                matches!(drain, DrainOutcome::TimedOut { .. }),
                drain.waited(),
            );

            report.record(ChunkReport {
                index,
                records: chunk.len(),
                merged: outcome.merged,
                skipped: outcome.skipped,
                ingest_elapsed,
                total_keys,
                drain,
            });

            match drain {
                DrainOutcome::TimedOut { lag, waited } => {
                    self.set_state(LoadState::TimedOut { chunk: index });
                    warn!(
                        stream = %stream,
                        chunk = index,
                        lag = ?lag,
                        threshold = self.config.lag_threshold,
                        waited_ms = waited.as_millis() as u64,
                        "Lag did not drain before deadline"
                    );
                    if self.config.timeout_policy == DrainTimeoutPolicy::Fail {
                        return Err(MaterializeError::DrainTimeout {
                            chunk: index,
                            waited,
                            lag,
                        });
                    }
                }
                DrainOutcome::Cancelled { .. } => {
                    report.cancelled = true;
                    break;
                }
                _ => {}
            }

            index += 1;
        }

        report.elapsed = start.elapsed();
        self.set_state(if report.cancelled {
            LoadState::Cancelled
        } else {
            LoadState::Done
        });

        info!(
            stream = %stream,
            records_loaded = report.records_loaded,
            records_skipped = report.records_skipped,
            chunks = report.chunks_processed,
            drained = report.chunks_drained,
            timed_out = report.chunks_timed_out,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Bulk load finished"
        );
        Ok(report)
    }

    /// Poll lag until it drains, the deadline passes, or the load is
    /// cancelled. A failed query counts as "not drained yet".
    async fn await_drain(
        &self,
        monitor: &dyn LagMonitor,
        stream: &str,
        chunk: usize,
    ) -> DrainOutcome {
        self.set_state(LoadState::AwaitingDrain { chunk });

        let start = Instant::now();
        let deadline = start + self.config.max_wait_per_chunk;
        let mut last_lag = None;

        loop {
            match monitor.outstanding_messages(stream).await {
                Ok(lag) => {
                    self.ingestor.metrics().record_lag(stream, lag);
                    if lag < self.config.lag_threshold || lag == 0 {
                        return DrainOutcome::Drained {
                            lag,
                            waited: start.elapsed(),
                        };
                    }
                    last_lag = Some(lag);
                }
                Err(e) => {
                    warn!(stream = %stream, chunk, error = %e, "Lag query failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return DrainOutcome::TimedOut {
                    lag: last_lag,
                    waited: start.elapsed(),
                };
            }

            let pause = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(stream = %stream, chunk, "Bulk load cancelled while awaiting drain");
                    return DrainOutcome::Cancelled { waited: start.elapsed() };
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
