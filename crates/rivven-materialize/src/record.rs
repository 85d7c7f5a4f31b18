//! Versioned records and last-write-wins resolution
//!
//! A [`VersionedRecord`] is one physical row per observed event. Records are
//! immutable; the current state of a key is computed at read time by
//! [`resolve_current`], never stored.
//!
//! The ordering key is `(event_ts_ms, sequence)`. Arrival order plays no
//! part, so the answer is the same for any delivery order of the same set of
//! versions.

use crate::event::{ChangeEvent, ChangeOp, RecordKey};
use crate::schema::Fields;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Total order of versions for one key.
///
/// Exact duplicates (same timestamp and sequence) are further ordered so
/// that a delete wins, which keeps resolution deterministic if a transport
/// ever reuses a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionOrder {
    pub event_ts_ms: i64,
    pub sequence: u64,
    pub is_deleted: bool,
}

/// One stored version of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub key: RecordKey,
    /// Fields of the image the operation selected
    pub payload: Fields,
    pub operation: ChangeOp,
    /// Source timestamp (Unix epoch millis)
    pub event_ts_ms: i64,
    pub sequence: u64,
    pub is_deleted: bool,
    /// When this version was stored (Unix epoch millis)
    pub ingest_ts_ms: i64,
}

impl VersionedRecord {
    /// Build the version for a decoded event.
    pub fn from_event(event: ChangeEvent, ingest_ts_ms: i64) -> Self {
        let is_deleted = event.is_delete();
        let payload = if is_deleted {
            event.before
        } else {
            event.after
        }
        .unwrap_or_default();

        Self {
            key: event.key,
            payload,
            operation: event.op,
            event_ts_ms: event.source_ts_ms,
            sequence: event.sequence,
            is_deleted,
            ingest_ts_ms,
        }
    }

    pub fn order(&self) -> VersionOrder {
        VersionOrder {
            event_ts_ms: self.event_ts_ms,
            sequence: self.sequence,
            is_deleted: self.is_deleted,
        }
    }

    /// Compare by last-write-wins order.
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order().cmp(&other.order())
    }

    /// Check if this version supersedes `other`.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.cmp_order(other) == Ordering::Greater
    }
}

/// Pick the current version among all versions of one key.
pub fn resolve_current(versions: &[VersionedRecord]) -> Option<&VersionedRecord> {
    versions.iter().max_by(|a, b| a.cmp_order(b))
}

/// Index of the current version.
pub fn current_index(versions: &[VersionedRecord]) -> Option<usize> {
    versions
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.cmp_order(b))
        .map(|(i, _)| i)
}
