use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about the targets the sync engine
/// tracks.
pub trait TargetMetadataProvider {
    /// Keys the client believes belong to `target_id` as of the last
    /// applied remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` once the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests. Changes for a pending target are
    /// ignored since they belong to a previous incarnation.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..Default::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Accumulates watch changes between consistent snapshots and turns them
/// into [`RemoteEvent`]s.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, metadata: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        let found = change
            .new_document
            .as_ref()
            .filter(|document| document.is_found_document());
        for &target_id in &change.updated_target_ids {
            match found {
                Some(document) => self.add_document_to_target(metadata, target_id, document.clone()),
                None => self.remove_document_from_target(
                    metadata,
                    target_id,
                    change.key.clone(),
                    change.new_document.clone(),
                ),
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(metadata, target_id, change.key.clone(), change.new_document.clone());
        }
    }

    pub fn handle_target_change(&mut self, metadata: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        let target_ids: Vec<TargetId> = if change.target_ids.is_empty() {
            self.target_states
                .keys()
                .copied()
                .filter(|&id| self.is_active_target(metadata, id))
                .collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(metadata, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A fresh incarnation of the target starts clean.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(metadata, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(metadata, target_id) {
                        // Reset drops the token too; only a token sent along
                        // with the reset survives.
                        self.reset_target(metadata, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the server's count with the locally tracked one and
    /// schedules a re-listen when they cannot be reconciled.
    pub fn handle_existence_filter(&mut self, metadata: &dyn TargetMetadataProvider, filter: &ExistenceFilterChange) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
            return;
        };
        let target = &target_data.target;
        if target.is_document_query() {
            if filter.count == 0 {
                // The one document the target watches is gone.
                match DocumentKey::from_path(target.path().clone()) {
                    Ok(key) => {
                        let deleted = Document::new_no_document(key.clone(), SnapshotVersion::min());
                        self.remove_document_from_target(metadata, target_id, key, Some(deleted));
                    }
                    Err(err) => log::warn!("document target {target_id} has an invalid path: {err}"),
                }
            } else if filter.count != 1 {
                log::warn!(
                    "single document target {target_id} reported an existence filter count of {}",
                    filter.count
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(metadata, target_id);
        if current_count == i64::from(filter.count) {
            return;
        }
        let status = match self.parse_bloom_filter(filter) {
            Some(bloom_filter) => self.apply_bloom_filter(metadata, &bloom_filter, filter, current_count),
            None => BloomFilterApplication::Skipped,
        };
        log::debug!(
            "existence filter mismatch for target {target_id}: expected {}, have {current_count}, bloom filter {status:?}",
            filter.count
        );
        if status != BloomFilterApplication::Success {
            self.reset_target(metadata, target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    /// Builds the event for everything accumulated so far and resets the
    /// pending state. Document read times are stamped with `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map_or(false, |state| state.current);
            if current && target_data.target.is_document_query() {
                // A current document target that never mentioned its document
                // proves the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let mentioned = self
                        .pending_document_target_mapping
                        .get(&key)
                        .map_or(false, |targets| targets.contains(&target_id));
                    if !mentioned && !target_contains_document(metadata, target_id, &key) {
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(metadata, target_id, key, Some(deleted));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|&target_id| {
                self.target_data_for_active_target(metadata, target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called for every add/remove request sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId, document: Document) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let change_type = if target_contains_document(metadata, target_id, document.key()) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        let key = document.key().clone();
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<Document>,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let contained = target_contains_document(metadata, target_id, &key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The add was never applied; dropping it is enough.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    /// Drops all changes for `target_id` and marks every document the client
    /// had for it as removed.
    fn reset_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(metadata, target_id, key, None);
        }
    }

    fn current_document_count_for_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.get_remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn parse_bloom_filter(&self, filter: &ExistenceFilterChange) -> Option<BloomFilter> {
        let params = filter.unchanged_names.as_ref()?;
        let bitmap = match BASE64_STANDARD.decode(params.bitmap.as_bytes()) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                log::warn!("bloom filter bitmap is not valid base64: {err}");
                return None;
            }
        };
        match BloomFilter::new(bitmap, params.padding, params.hash_count) {
            Ok(bloom_filter) if bloom_filter.bit_count() > 0 => Some(bloom_filter),
            Ok(_) => None,
            Err(err) => {
                log::warn!("applying bloom filter failed: {err}");
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        filter: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let mut removed = 0i64;
        for key in metadata.get_remote_keys_for_target(filter.target_id) {
            let name = self.serializer.document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(metadata, filter.target_id, key, None);
                removed += 1;
            }
        }
        if i64::from(filter.count) == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(metadata, target_id).is_some()
    }

    fn target_data_for_active_target<'m>(
        &self,
        metadata: &'m dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<&'m TargetData> {
        if self
            .target_states
            .get(&target_id)
            .map_or(false, TargetState::is_pending)
        {
            return None;
        }
        metadata.get_target_data_for_target(target_id)
    }
}

fn target_contains_document(metadata: &dyn TargetMetadataProvider, target_id: TargetId, key: &DocumentKey) -> bool {
    metadata.get_remote_keys_for_target(target_id).contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::model::{DatabaseId, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::HashMap;

    struct Metadata {
        targets: HashMap<TargetId, TargetData>,
        remote_keys: HashMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TargetMetadataProvider for Metadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
            self.targets.get(&target_id)
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    fn metadata(target: Target, purpose: TargetPurpose, keys: &[&str]) -> Metadata {
        let mut targets = HashMap::new();
        targets.insert(2, TargetData::new(target, 2, purpose, 1));
        let mut remote_keys = HashMap::new();
        remote_keys.insert(2, keys.iter().map(|path| key(path)).collect());
        Metadata { targets, remote_keys }
    }

    fn rooms() -> Target {
        Query::collection("rooms").unwrap().to_target()
    }

    fn found(path: &str) -> Document {
        Document::new_found(key(path), version(1), MapValue::default())
    }

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    #[test]
    fn document_changes_are_added_or_modified() {
        let metadata = metadata(rooms(), TargetPurpose::Listen, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        for path in ["rooms/a", "rooms/b"] {
            aggregator.handle_document_change(
                &metadata,
                DocumentWatchChange {
                    updated_target_ids: vec![2],
                    removed_target_ids: vec![],
                    key: key(path),
                    new_document: Some(found(path)),
                },
            );
        }

        let event = aggregator.create_remote_event(&metadata, version(5));
        let change = &event.target_changes[&2];
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.added_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates[&key("rooms/b")].read_time(), version(5));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_ignored() {
        let metadata = metadata(rooms(), TargetPurpose::Listen, &[]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(
            &metadata,
            DocumentWatchChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                key: key("rooms/a"),
                new_document: Some(found("rooms/a")),
            },
        );
        aggregator.handle_target_change(
            &metadata,
            &WatchTargetChange {
                state: WatchTargetChangeState::Added,
                target_ids: vec![2],
                resume_token: vec![1],
                cause: None,
            },
        );

        let event = aggregator.create_remote_event(&metadata, version(5));
        assert!(event.document_updates.is_empty());
        assert_eq!(event.target_changes[&2].resume_token, vec![1]);
    }

    #[test]
    fn current_document_targets_synthesize_deletes() {
        let target = Target::for_document(&key("rooms/eros"));
        let metadata = metadata(target, TargetPurpose::LimboResolution, &[]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.handle_target_change(
            &metadata,
            &WatchTargetChange {
                state: WatchTargetChangeState::Current,
                target_ids: vec![2],
                resume_token: vec![7],
                cause: None,
            },
        );

        let event = aggregator.create_remote_event(&metadata, version(5));
        assert!(event.document_updates[&key("rooms/eros")].is_no_document());
        assert!(event.resolved_limbo_documents.contains(&key("rooms/eros")));
    }

    #[test]
    fn mismatch_without_bloom_filter_resets_the_target() {
        let metadata = metadata(rooms(), TargetPurpose::Listen, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            },
        );

        let event = aggregator.create_remote_event(&metadata, version(5));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
        assert!(!event.target_changes[&2].current);
    }

    #[test]
    fn matching_counts_leave_the_target_alone() {
        let metadata = metadata(rooms(), TargetPurpose::Listen, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(5));
        assert!(event.target_mismatches.is_empty());
    }
}
