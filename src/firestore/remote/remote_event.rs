use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// One consistent snapshot of watch changes, ready to be applied to the
/// local store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose local result set drifted from the server's. They are
    /// re-listened from scratch with the given purpose.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Limbo documents only referenced by their own limbo target.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event that only flips the `current` state of `target_id`. Used to
    /// replay target state reported by another client.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Default::default()
        }
    }
}

/// Changes to the membership and state of one target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server did not send a new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Default::default()
        }
    }
}
