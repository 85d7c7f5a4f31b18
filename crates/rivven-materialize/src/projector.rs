//! # Soft-Delete Projector
//!
//! Read-side views over a [`VersionStore`]:
//!
//! - **CurrentView**: the current version of every key, deleted or not.
//! - **ActiveView**: the CurrentView without keys whose current version is
//!   a delete.
//!
//! Both are computed from `current_of` on demand. There is no second copy of
//! the data, so a view can never hold a row the store has since deleted.
//!
//! Scans are lazy: the key list is captured when the scan starts and each
//! key is resolved when the iterator reaches it. Calling `scan` again starts
//! over.

use crate::error::Result;
use crate::event::RecordKey;
use crate::record::VersionedRecord;
use crate::store::VersionStore;
use std::sync::Arc;

/// Which view a scan yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Current versions, including deletes
    Current,
    /// Current versions that are not deletes
    Active,
}

/// Projector over a version store.
pub struct SoftDeleteProjector<S: VersionStore> {
    store: Arc<S>,
}

impl<S: VersionStore> Clone for SoftDeleteProjector<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: VersionStore> SoftDeleteProjector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Lazily scan the ActiveView.
    pub fn scan(&self) -> Result<ViewScan<S>> {
        self.scan_view(ViewKind::Active, None)
    }

    /// Lazily scan the ActiveView of one entity.
    pub fn scan_entity(&self, entity: &str) -> Result<ViewScan<S>> {
        self.scan_view(ViewKind::Active, Some(entity))
    }

    /// Lazily scan the CurrentView.
    pub fn scan_current(&self) -> Result<ViewScan<S>> {
        self.scan_view(ViewKind::Current, None)
    }

    fn scan_view(&self, kind: ViewKind, entity: Option<&str>) -> Result<ViewScan<S>> {
        let mut keys = self.store.keys()?;
        if let Some(entity) = entity {
            keys.retain(|k| k.entity == entity);
        }

        Ok(ViewScan {
            store: self.store.clone(),
            keys: keys.into_iter(),
            kind,
        })
    }

    /// Active version of a key, if the key exists and is not deleted.
    pub fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>> {
        Ok(self.store.current_of(key)?.filter(|r| !r.is_deleted))
    }

    /// Check if the key is in the ActiveView.
    pub fn contains(&self, key: &RecordKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of keys in the ActiveView.
    pub fn active_count(&self) -> Result<usize> {
        let mut count = 0;
        for record in self.scan()? {
            record?;
            count += 1;
        }
        Ok(count)
    }
}

/// Lazy view scan. Yields `Err` if the store becomes unavailable mid-scan.
pub struct ViewScan<S: VersionStore> {
    store: Arc<S>,
    keys: std::vec::IntoIter<RecordKey>,
    kind: ViewKind,
}

impl<S: VersionStore> ViewScan<S> {
    /// Keys not yet visited.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

impl<S: VersionStore> Iterator for ViewScan<S> {
    type Item = Result<VersionedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.store.current_of(&key) {
                Ok(Some(record)) => {
                    if self.kind == ViewKind::Active && record.is_deleted {
                        continue;
                    }
                    return Some(Ok(record));
                }
                // Truncated since the scan started
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeOp;
    use crate::schema::Fields;
    use crate::store::MemoryVersionStore;

    fn merge(store: &MemoryVersionStore, id: &str, ts: i64, op: ChangeOp) {
        store
            .merge(VersionedRecord {
                key: RecordKey::new("titles", id),
                payload: Fields::new(),
                operation: op,
                event_ts_ms: ts,
                sequence: ts as u64,
                is_deleted: op == ChangeOp::Delete,
                ingest_ts_ms: 0,
            })
            .unwrap();
    }

    #[test]
    fn test_active_view_filters_deleted() {
        let store = Arc::new(MemoryVersionStore::new());
        merge(&store, "a", 1, ChangeOp::Create);
        merge(&store, "b", 1, ChangeOp::Create);
        merge(&store, "b", 2, ChangeOp::Delete);

        let projector = SoftDeleteProjector::new(store);
        let active: Vec<_> = projector
            .scan()
            .unwrap()
            .map(|r| r.unwrap().key.id)
            .collect();
        assert_eq!(active, vec!["a"]);

        let current: Vec<_> = projector
            .scan_current()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(current.len(), 2);
        assert!(current[1].is_deleted);
    }

    #[test]
    fn test_late_delete_does_not_hide_newer_update() {
        let store = Arc::new(MemoryVersionStore::new());
        merge(&store, "a", 10, ChangeOp::Update);
        // Delete older than the update arrives late
        merge(&store, "a", 5, ChangeOp::Delete);

        let projector = SoftDeleteProjector::new(store);
        assert!(projector.contains(&RecordKey::new("titles", "a")).unwrap());
    }

    #[test]
    fn test_scan_is_restartable_and_live() {
        let store = Arc::new(MemoryVersionStore::new());
        merge(&store, "a", 1, ChangeOp::Create);
        let projector = SoftDeleteProjector::new(store.clone());

        assert_eq!(projector.scan().unwrap().count(), 1);
        merge(&store, "b", 1, ChangeOp::Create);
        assert_eq!(projector.scan().unwrap().count(), 2);
        assert_eq!(projector.active_count().unwrap(), 2);
    }

    #[test]
    fn test_scan_resolves_lazily() {
        let store = Arc::new(MemoryVersionStore::new());
        merge(&store, "a", 1, ChangeOp::Create);
        merge(&store, "b", 1, ChangeOp::Create);
        let projector = SoftDeleteProjector::new(store.clone());

        let mut scan = projector.scan().unwrap();
        assert_eq!(scan.next().unwrap().unwrap().key.id, "a");
        // Deleted after the scan started but before it reached the key
        merge(&store, "b", 2, ChangeOp::Delete);
        assert!(scan.next().is_none());
    }

    #[test]
    fn test_scan_entity() {
        let store = Arc::new(MemoryVersionStore::new());
        merge(&store, "a", 1, ChangeOp::Create);
        store
            .merge(VersionedRecord {
                key: RecordKey::new("people", "p1"),
                payload: Fields::new(),
                operation: ChangeOp::Create,
                event_ts_ms: 1,
                sequence: 1,
                is_deleted: false,
                ingest_ts_ms: 0,
            })
            .unwrap();

        let projector = SoftDeleteProjector::new(store);
        assert_eq!(projector.scan_entity("people").unwrap().count(), 1);
        assert_eq!(projector.scan().unwrap().count(), 2);
    }

    #[test]
    fn test_unavailable_store_surfaces_in_scan() {
        let store = Arc::new(MemoryVersionStore::new());
        merge(&store, "a", 1, ChangeOp::Create);
        let projector = SoftDeleteProjector::new(store.clone());

        let mut scan = projector.scan().unwrap();
        store.close();
        assert!(scan.next().unwrap().is_err());
        assert!(projector.scan().is_err());
    }
}
