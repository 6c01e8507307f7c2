//! Client-side view of one query: the documents it currently returns and the
//! bookkeeping needed to turn local and remote changes into snapshots.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::{DocumentComparator, DocumentSet};
use crate::firestore::core::online_state::OnlineState;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::TargetChange;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// Set when a limit query lost a document at its edge and must be
    /// recomputed from the full local result set.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Documents and keys returned by a local query execution.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

pub struct View {
    query: Query,
    current: bool,
    document_set: DocumentSet,
    sync_state: SyncState,
    limbo_documents: BTreeSet<DocumentKey>,
    /// Keys the server reported as part of the target.
    synced_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    comparator: DocumentComparator,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::for_query(&query);
        let comparator = document_set.comparator();
        Self {
            query,
            current: false,
            document_set,
            sync_state: SyncState::Local,
            limbo_documents: BTreeSet::new(),
            synced_documents,
            mutated_keys: BTreeSet::new(),
            comparator,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Folds `changes` into the view's documents without applying them.
    /// `previous` chains a second pass after a limit refill.
    pub fn compute_doc_changes(
        &self,
        changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let at_limit = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() == limit as usize);
        let last_in_limit = (at_limit && self.query.limit_type() == LimitType::First)
            .then(|| old_document_set.last().cloned())
            .flatten();
        let first_in_limit = (at_limit && self.query.limit_type() == LimitType::Last)
            .then(|| old_document_set.first().cloned())
            .flatten();

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);
            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new.clone()));
                            applied = true;
                            let past_last = last_in_limit.as_ref().is_some_and(|last| {
                                (self.comparator)(new, last) == Ordering::Greater
                            });
                            let before_first = first_in_limit.as_ref().is_some_and(|first| {
                                (self.comparator)(new, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new.clone()));
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()));
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()));
                    applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new) => {
                        document_set.insert(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes and, when anything is observable, produces a
    /// snapshot.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| (self.comparator)(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            documents: self.document_set.clone(),
            old_documents,
            document_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            exclude_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline marks the view as no longer current so the next
    /// snapshot reports `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Resets the view to a freshly executed local query, e.g. after another
    /// client changed the target's state.
    pub fn synchronize_with_persisted_state(&mut self, result: QueryResult) -> ViewChange {
        self.synced_documents = result.remote_keys;
        self.limbo_documents.clear();
        let changes = self.compute_doc_changes(&result.documents, None);
        self.apply_changes(changes, true, None, false)
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == SyncState::Local,
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// A locally modified document whose write was just acknowledged is not
/// reported until the server's version of it arrives.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}
