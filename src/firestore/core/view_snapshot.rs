use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    /// Order in which changes are reported within one snapshot.
    pub(crate) fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Added => 0,
            ChangeType::Removed => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: Document) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Accumulates view changes keyed by document, merging successive changes
/// to the same document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Added, Metadata) | (Added, Modified) => {
                Some(DocumentViewChange::new(Added, change.document))
            }
            (Metadata, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Metadata, Modified) | (Modified, Modified) | (Modified, Metadata) => {
                Some(DocumentViewChange::new(Modified, change.document))
            }
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (Metadata, Metadata) => Some(DocumentViewChange::new(Metadata, change.document)),
            (previous, next) => {
                log::warn!("unexpected change sequence {previous:?} -> {next:?} for {key}");
                Some(change)
            }
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Whether a view reflects the backend or only the local cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// The results of a query at one point in time, with the changes since the
/// previous snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub exclude_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot, reporting every document as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        let old_documents = DocumentSet::new(documents.comparator());
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            exclude_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn doc(path: &str, seconds: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0)),
            MapValue::empty(),
        )
    }

    #[test]
    fn merges_changes_for_one_document() {
        let mut set = DocumentChangeSet::new();
        set.track(DocumentViewChange::new(ChangeType::Added, doc("c/a", 1)));
        set.track(DocumentViewChange::new(ChangeType::Modified, doc("c/a", 2)));
        set.track(DocumentViewChange::new(ChangeType::Removed, doc("c/b", 1)));
        set.track(DocumentViewChange::new(ChangeType::Added, doc("c/b", 3)));
        set.track(DocumentViewChange::new(ChangeType::Added, doc("c/c", 1)));
        set.track(DocumentViewChange::new(ChangeType::Removed, doc("c/c", 1)));

        let changes = set.into_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, ChangeType::Added);
        assert_eq!(changes[0].document.version(), doc("c/a", 2).version());
        assert_eq!(changes[1].change_type, ChangeType::Modified);
    }

    #[test]
    fn initial_snapshot_reports_everything_as_added() {
        let mut documents = DocumentSet::key_ordered();
        documents.insert(doc("c/a", 1));
        documents.insert(doc("c/b", 1));
        let snapshot = ViewSnapshot::from_initial_documents(
            Query::collection("c").unwrap(),
            documents,
            BTreeSet::new(),
            true,
            false,
        );
        assert_eq!(snapshot.document_changes.len(), 2);
        assert!(snapshot.old_documents.is_empty());
        assert!(!snapshot.has_pending_writes());
    }
}
