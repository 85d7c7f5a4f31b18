//! # Versioned Store
//!
//! Append-only store of [`VersionedRecord`]s keyed by [`RecordKey`].
//!
//! ## Merge semantics
//!
//! `merge` stores every incoming version unconditionally. It never looks at
//! prior state. Comparison happens only at read time in `current_of`, which
//! makes merge commutative and idempotent under at-least-once delivery:
//! a redelivered event adds an identical version that resolves to the same
//! current answer.
//!
//! ## Concurrency
//!
//! [`MemoryVersionStore`] shards keys over independently locked maps, so
//! merges for different keys proceed in parallel. A merge is applied under
//! its shard's write lock; readers never observe a half-applied merge.
//!
//! ```text
//!   merge(k1) ──► shard[h(k1)] ─┐
//!   merge(k2) ──► shard[h(k2)] ─┼── RwLock<HashMap<RecordKey, Vec<VersionedRecord>>>
//!   current_of(k1) ─────────────┘   (resolve_current at read time)
//! ```

use crate::error::{MaterializeError, Result};
use crate::event::RecordKey;
use crate::record::{current_index, resolve_current, VersionedRecord};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Storage backend for versioned records.
///
/// Every method returns `Err(StoreUnavailable)` when the backing storage is
/// gone; that is the only fatal error on the ingestion and read paths.
pub trait VersionStore: Send + Sync {
    /// Append a version. Never compares against stored state.
    fn merge(&self, record: VersionedRecord) -> Result<()>;

    /// Append several versions.
    fn merge_batch(&self, records: Vec<VersionedRecord>) -> Result<usize> {
        let count = records.len();
        for record in records {
            self.merge(record)?;
        }
        Ok(count)
    }

    /// Current version of a key by last-write-wins.
    fn current_of(&self, key: &RecordKey) -> Result<Option<VersionedRecord>>;

    /// Every stored version of a key, in storage order.
    fn all_versions_of(&self, key: &RecordKey) -> Result<Vec<VersionedRecord>>;

    /// All keys with at least one version, sorted.
    fn keys(&self) -> Result<Vec<RecordKey>>;

    /// Number of distinct keys.
    fn key_count(&self) -> Result<usize>;

    /// Number of stored versions across all keys.
    fn version_count(&self) -> Result<usize>;

    /// Atomically remove the versions of `key` chosen by `select`.
    ///
    /// `select` sees the key's versions in storage order and returns indices
    /// to drop. The current version is never removed, even if selected.
    /// Returns the number of versions removed.
    fn remove_versions(
        &self,
        key: &RecordKey,
        select: &dyn Fn(&[VersionedRecord]) -> Vec<usize>,
    ) -> Result<usize>;

    /// Drop everything (full reset).
    fn truncate(&self) -> Result<()>;
}

/// Number of shards (should be power of 2)
const SHARD_COUNT: usize = 64;

type Shard = RwLock<HashMap<RecordKey, Vec<VersionedRecord>>>;

/// In-memory sharded version store.
pub struct MemoryVersionStore {
    shards: [Shard; SHARD_COUNT],
    versions: AtomicUsize,
    keys: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryVersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryVersionStore")
            .field("keys", &self.keys.load(Ordering::Relaxed))
            .field("versions", &self.versions.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
            versions: AtomicUsize::new(0),
            keys: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Close the store. Every later operation fails with `StoreUnavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MaterializeError::store_unavailable("version store is closed"))
        } else {
            Ok(())
        }
    }

    fn shard(&self, key: &RecordKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }
}

impl VersionStore for MemoryVersionStore {
    fn merge(&self, record: VersionedRecord) -> Result<()> {
        self.ensure_open()?;

        let mut shard = self.shard(&record.key).write();
        match shard.get_mut(&record.key) {
            Some(versions) => versions.push(record),
            None => {
                shard.insert(record.key.clone(), vec![record]);
                self.keys.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.versions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn current_of(&self, key: &RecordKey) -> Result<Option<VersionedRecord>> {
        self.ensure_open()?;

        let shard = self.shard(key).read();
        Ok(shard
            .get(key)
            .and_then(|versions| resolve_current(versions))
            .cloned())
    }

    fn all_versions_of(&self, key: &RecordKey) -> Result<Vec<VersionedRecord>> {
        self.ensure_open()?;

        let shard = self.shard(key).read();
        Ok(shard.get(key).cloned().unwrap_or_default())
    }

    fn keys(&self) -> Result<Vec<RecordKey>> {
        self.ensure_open()?;

        let mut keys = Vec::with_capacity(self.keys.load(Ordering::Relaxed));
        for shard in &self.shards {
            keys.extend(shard.read().keys().cloned());
        }
        keys.sort();
        Ok(keys)
    }

    fn key_count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.keys.load(Ordering::Relaxed))
    }

    fn version_count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.versions.load(Ordering::Relaxed))
    }

    fn remove_versions(
        &self,
        key: &RecordKey,
        select: &dyn Fn(&[VersionedRecord]) -> Vec<usize>,
    ) -> Result<usize> {
        self.ensure_open()?;

        let mut shard = self.shard(key).write();
        let Some(versions) = shard.get_mut(key) else {
            return Ok(0);
        };
        let Some(current) = current_index(versions) else {
            return Ok(0);
        };

        let mut doomed = vec![false; versions.len()];
        for index in select(versions) {
            if index < doomed.len() && index != current {
                doomed[index] = true;
            }
        }

        let before = versions.len();
        let mut flags = doomed.into_iter();
        versions.retain(|_| !flags.next().unwrap_or(false));
        let removed = before - versions.len();

        self.versions.fetch_sub(removed, Ordering::Relaxed);
        Ok(removed)
    }

    fn truncate(&self) -> Result<()> {
        self.ensure_open()?;

        for shard in &self.shards {
            shard.write().clear();
        }
        self.versions.store(0, Ordering::Relaxed);
        self.keys.store(0, Ordering::Relaxed);
        Ok(())
    }
}
