//! Retention Management
//!
//! Per-stream time and size bounds on the raw event log.
//!
//! | Setting | Type | Default | Description |
//! |---------|------|---------|-------------|
//! | `retention_ms` | u64 | 604800000 | Event retention time (7 days) |
//! | `retention_bytes` | u64 | unlimited | Max bytes per stream |
//!
//! Retention is applied by the transport. Subscribers receive every change
//! through [`RetentionManager::subscribe`]. A change only affects segments
//! created after it; [`RetentionManager::policy_for_segment`] answers with
//! the policy that was in effect when a segment was opened.
//!
//! Materialized state never depends on the raw log: once an event is merged
//! its version lives in the store, so expiring raw events does not change
//! any `current_of` answer. The compactor consults this manager for the
//! window during which superseded versions are kept.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Default retention time (7 days in milliseconds)
pub const DEFAULT_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Retention bound for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Event retention time in milliseconds
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Max bytes to retain (None = unlimited)
    #[serde(default)]
    pub retention_bytes: Option<u64>,
}

fn default_retention_ms() -> u64 {
    DEFAULT_RETENTION_MS
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_ms: DEFAULT_RETENTION_MS,
            retention_bytes: None,
        }
    }
}

impl RetentionPolicy {
    pub fn from_duration(retention: Duration) -> Self {
        Self {
            retention_ms: u64::try_from(retention.as_millis()).unwrap_or(u64::MAX),
            retention_bytes: None,
        }
    }

    /// Get retention duration
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// Check if a segment whose newest event is `newest_ts_ms` has aged out.
    pub fn is_expired(&self, newest_ts_ms: i64, now_ms: i64) -> bool {
        let retention_ms = i64::try_from(self.retention_ms).unwrap_or(i64::MAX);
        now_ms.saturating_sub(newest_ts_ms) >= retention_ms
    }

    /// Check if a stream of `size_bytes` exceeds the size bound.
    pub fn exceeds_size(&self, size_bytes: u64) -> bool {
        self.retention_bytes.is_some_and(|limit| size_bytes > limit)
    }
}

/// Notification of a retention change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionChange {
    pub stream: String,
    pub policy: RetentionPolicy,
    /// Segments created at or after this time use the new policy
    pub effective_from_ms: i64,
}

#[derive(Debug, Clone)]
struct PolicyEpoch {
    effective_from_ms: i64,
    policy: RetentionPolicy,
}

/// Per-stream retention registry.
pub struct RetentionManager {
    default_policy: RetentionPolicy,
    /// Policy history per stream, oldest first
    policies: RwLock<HashMap<String, Vec<PolicyEpoch>>>,
    change_tx: broadcast::Sender<RetentionChange>,
}

impl Default for RetentionManager {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl std::fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionManager")
            .field("default_policy", &self.default_policy)
            .field("streams", &self.policies.read().len())
            .finish()
    }
}

impl RetentionManager {
    /// Create a manager with the policy used for unconfigured streams.
    pub fn new(default_policy: RetentionPolicy) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            default_policy,
            policies: RwLock::new(HashMap::new()),
            change_tx,
        }
    }

    /// Subscribe to retention change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RetentionChange> {
        self.change_tx.subscribe()
    }

    /// Set the retention duration of a stream, effective now.
    pub fn set_retention(&self, stream: &str, retention: Duration) -> RetentionChange {
        let mut policy = self.policy(stream);
        policy.retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        self.set_policy_at(stream, policy, Utc::now().timestamp_millis())
    }

    /// Set the size bound of a stream, effective now.
    pub fn set_retention_bytes(&self, stream: &str, bytes: Option<u64>) -> RetentionChange {
        let mut policy = self.policy(stream);
        policy.retention_bytes = bytes;
        self.set_policy_at(stream, policy, Utc::now().timestamp_millis())
    }

    /// Replace the policy of a stream from `effective_from_ms` on.
    pub fn set_policy_at(
        &self,
        stream: &str,
        policy: RetentionPolicy,
        effective_from_ms: i64,
    ) -> RetentionChange {
        {
            let mut policies = self.policies.write();
            let history = policies.entry(stream.to_string()).or_default();
            let at = history.partition_point(|e| e.effective_from_ms <= effective_from_ms);
            history.insert(
                at,
                PolicyEpoch {
                    effective_from_ms,
                    policy,
                },
            );
        }

        info!(
            stream = %stream,
            retention_ms = policy.retention_ms,
            retention_bytes = ?policy.retention_bytes,
            "Retention updated"
        );

        let change = RetentionChange {
            stream: stream.to_string(),
            policy,
            effective_from_ms,
        };
        let _ = self.change_tx.send(change.clone());
        change
    }

    /// Policy currently in effect for new segments of a stream.
    ///
    /// Changes scheduled for later through [`set_policy_at`](Self::set_policy_at)
    /// are not applied until their effective time.
    pub fn policy(&self, stream: &str) -> RetentionPolicy {
        self.policy_for_segment(stream, Utc::now().timestamp_millis())
    }

    /// Explicit policy of a stream in effect at `at_ms`, if any.
    pub fn policy_in_effect(&self, stream: &str, at_ms: i64) -> Option<RetentionPolicy> {
        let policies = self.policies.read();
        let history = policies.get(stream)?;

        let applicable = history.partition_point(|e| e.effective_from_ms <= at_ms);
        applicable.checked_sub(1).map(|i| history[i].policy)
    }

    /// Policy that governs a segment opened at `segment_created_ms`.
    pub fn policy_for_segment(&self, stream: &str, segment_created_ms: i64) -> RetentionPolicy {
        self.policy_in_effect(stream, segment_created_ms)
            .unwrap_or(self.default_policy)
    }

    /// Check if a segment has aged out under the policy it was created with.
    pub fn is_segment_expired(
        &self,
        stream: &str,
        segment_created_ms: i64,
        newest_ts_ms: i64,
        now_ms: i64,
    ) -> bool {
        self.policy_for_segment(stream, segment_created_ms)
            .is_expired(newest_ts_ms, now_ms)
    }

    /// How long superseded versions of a stream are kept before compaction.
    pub fn superseded_window(&self, stream: &str) -> Duration {
        self.policy(stream).retention()
    }

    /// Streams with an explicit policy.
    pub fn streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self.policies.read().keys().cloned().collect();
        streams.sort();
        streams
    }
}
