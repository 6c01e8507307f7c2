//! The local store ties the persisted caches together.
//!
//! It owns the per-user components (mutation queue, overlay cache, index
//! manager), the in-memory map of active targets and the documents pinned by
//! live views. Every method runs one persistence transaction; callers are
//! expected to invoke them from the async queue so they never interleave.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::core::{Query, QueryResult, Target};
use crate::firestore::credentials::User;
use crate::firestore::error::{internal_error, is_primary_lease_lost, is_transient_storage_error, FirestoreResult};
use crate::firestore::local::bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::firestore::local::schema::{
    complete_data_migration, pending_data_migrations, BUILD_OVERLAYS_MIGRATION, MUTATIONS_STORE,
};
use crate::firestore::local::simple_db::{KeyPart, KeyRange};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, FieldIndex, FieldMask, IndexOffset, Mutation, MutationBatch,
    MutationBatchResult, Precondition, ResourcePath, SnapshotVersion, TargetId, Timestamp,
    BATCH_ID_UNKNOWN, INITIAL_LARGEST_BATCH_ID,
};
use crate::firestore::remote::RemoteEvent;
use crate::firestore::settings::IndexAutoCreationSettings;

/// Resume tokens older than this are persisted even if nothing else about
/// the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Keys a view started or stopped tracking after applying a snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Result of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, Document>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Result of [`LocalStore::write_locally`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, Document>,
}

/// Components namespaced by the current user.
#[derive(Clone, Debug)]
struct UserComponents {
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
    local_documents: LocalDocumentsView,
}

impl UserComponents {
    fn new(user: &User, persistence: &Persistence, remote_documents: &RemoteDocumentCache) -> Self {
        let serializer = persistence.serializer().clone();
        let mutation_queue = MutationQueue::new(user.storage_key(), serializer.clone());
        let overlays = DocumentOverlayCache::new(user.storage_key(), serializer);
        let index_manager = IndexManager::new(user.storage_key());
        let local_documents = LocalDocumentsView::new(
            remote_documents.clone(),
            mutation_queue.clone(),
            overlays.clone(),
            index_manager.clone(),
        );
        Self {
            mutation_queue,
            overlays,
            index_manager,
            local_documents,
        }
    }
}

struct LocalStoreState {
    user: User,
    components: UserComponents,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    /// Highest read time seen per collection group, for picking up
    /// documents other clients wrote.
    collection_group_read_time: BTreeMap<String, SnapshotVersion>,
}

pub struct LocalStore {
    persistence: Arc<Persistence>,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    bundle_cache: BundleCache,
    local_view_references: Arc<Mutex<ReferenceSet>>,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, user: User, index_auto_creation: IndexAutoCreationSettings) -> Arc<Self> {
        let serializer = persistence.serializer().clone();
        let remote_documents = RemoteDocumentCache::new(serializer.clone());
        let components = UserComponents::new(&user, &persistence, &remote_documents);
        let local_view_references = Arc::new(Mutex::new(ReferenceSet::new()));
        persistence
            .reference_delegate()
            .set_in_memory_pins(Arc::clone(&local_view_references));
        Arc::new(Self {
            target_cache: TargetCache::new(serializer.clone()),
            bundle_cache: BundleCache::new(serializer),
            remote_documents,
            local_view_references,
            state: Mutex::new(LocalStoreState {
                user,
                components,
                query_engine: QueryEngine::new(index_auto_creation),
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: BTreeMap::new(),
                collection_group_read_time: BTreeMap::new(),
            }),
            persistence,
        })
    }

    fn state(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn components(&self) -> UserComponents {
        self.state().components.clone()
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> User {
        self.state().user.clone()
    }

    pub fn index_manager(&self) -> IndexManager {
        self.state().components.index_manager.clone()
    }

    pub fn local_documents(&self) -> LocalDocumentsView {
        self.state().components.local_documents.clone()
    }

    /// Runs data migrations that were deferred by the schema upgrade.
    pub fn start(&self) -> FirestoreResult<()> {
        let remote_documents = self.remote_documents.clone();
        let persistence = Arc::clone(&self.persistence);
        self.persistence
            .run_transaction("Run data migrations", TransactionMode::ReadWrite, |txn| {
                if !pending_data_migrations(txn)?.iter().any(|name| name == BUILD_OVERLAYS_MIGRATION) {
                    return Ok(());
                }
                let mut users = BTreeSet::new();
                for key in txn.scan_keys(MUTATIONS_STORE, &KeyRange::all())? {
                    if let Some(KeyPart::Str(user)) = key.first() {
                        users.insert(user.clone());
                    }
                }
                for user_id in users {
                    let user = if user_id.is_empty() {
                        User::unauthenticated()
                    } else {
                        User::new(user_id)
                    };
                    let components = UserComponents::new(&user, &persistence, &remote_documents);
                    let mut keys = BTreeSet::new();
                    for batch in components.mutation_queue.get_all_mutation_batches(txn)? {
                        keys.extend(batch.keys());
                    }
                    components
                        .local_documents
                        .recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                }
                log::debug!("built document overlays from the mutation queue");
                complete_data_migration(txn, BUILD_OVERLAYS_MIGRATION)
            })
    }

    /// Switches to `user`'s mutation queue and returns the documents whose
    /// local view may have changed.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old = self.components();
        let new = UserComponents::new(&user, &self.persistence, &self.remote_documents);
        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = old.mutation_queue.get_all_mutation_batches(txn)?;
                let new_batches = new.mutation_queue.get_all_mutation_batches(txn)?;
                let mut changed_keys = BTreeSet::new();
                let mut removed_batch_ids = Vec::new();
                let mut added_batch_ids = Vec::new();
                for batch in &old_batches {
                    removed_batch_ids.push(batch.batch_id);
                    changed_keys.extend(batch.keys());
                }
                for batch in &new_batches {
                    added_batch_ids.push(batch.batch_id);
                    changed_keys.extend(batch.keys());
                }
                Ok((changed_keys, removed_batch_ids, added_batch_ids))
            })?;
        let (changed_keys, removed_batch_ids, added_batch_ids) = result;
        let affected_documents = self
            .persistence
            .run_transaction("Read changed documents", TransactionMode::ReadWrite, |txn| {
                new.local_documents.get_documents(txn, &changed_keys)
            })?;

        let mut state = self.state();
        state.user = user;
        state.components = new;
        Ok(UserChangeResult {
            affected_documents,
            removed_batch_ids,
            added_batch_ids,
        })
    }

    /// Appends a batch to the mutation queue and returns the new local views.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let components = self.components();
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key.clone()).collect();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote = self.remote_documents.get_entries(txn, &keys)?;
                let without_remote_version: BTreeSet<DocumentKey> = remote
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = components.local_documents.get_overlayed_documents(txn, remote)?;

                // Transforms that depend on the current value (increment)
                // are pinned to the local view they were applied to.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(document) = overlayed.get(&mutation.key) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&document.document) {
                        let mask = FieldMask::new(base_value.field_mask());
                        base_mutations.push(
                            Mutation::patch(mutation.key.clone(), base_value, mask)
                                .with_precondition(Precondition::Exists(true)),
                        );
                    }
                }

                let batch = components.mutation_queue.add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                components.overlays.save_overlays(txn, batch.batch_id, &overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
    }

    /// Applies an acknowledged batch to the remote document cache and drops
    /// it from the queue.
    pub fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let components = self.components();
        let affected = result.batch.keys();
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = self.remote_documents.new_change_buffer();
                self.apply_write_to_remote_documents(txn, &components, result, &mut buffer)?;
                buffer.apply(txn)?;
                components.mutation_queue.perform_consistency_check(txn)?;
                components.overlays.remove_overlays_for_batch_id(txn, result.batch.batch_id)?;
                components
                    .local_documents
                    .recalculate_and_save_overlays_for_document_keys(txn, &keys_with_transform_results(result))?;
                components.local_documents.get_documents(txn, &affected)
            })
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        components: &UserComponents,
        result: &MutationBatchResult,
        buffer: &mut RemoteDocumentChangeBuffer,
    ) -> FirestoreResult<()> {
        let batch = &result.batch;
        for key in batch.keys() {
            let mut document = buffer.get_entry(txn, &key)?;
            let Some(ack_version) = result.doc_versions.get(&key) else {
                return Err(internal_error(format!("No version for acknowledged document {key}")));
            };
            if document.version() < *ack_version {
                batch.apply_to_remote_document(&mut document, result);
                if document.is_valid_document() {
                    document.set_read_time(result.commit_version);
                    buffer.add_entry(document);
                }
            }
        }
        components
            .mutation_queue
            .acknowledge_batch(txn, batch, &result.stream_token)?;
        components.mutation_queue.remove_mutation_batch(txn, batch)
    }

    /// Removes a batch the backend rejected and returns the reverted views.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let components = self.components();
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = components
                    .mutation_queue
                    .lookup_mutation_batch(txn, batch_id)?
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                let affected = batch.keys();
                components.mutation_queue.remove_mutation_batch(txn, &batch)?;
                components.mutation_queue.perform_consistency_check(txn)?;
                components.overlays.remove_overlays_for_batch_id(txn, batch_id)?;
                components
                    .local_documents
                    .recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                components.local_documents.get_documents(txn, &affected)
            })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let components = self.components();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                components.mutation_queue.get_highest_unacknowledged_batch_id(txn)
            })
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let components = self.components();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                components.mutation_queue.get_last_stream_token(txn)
            })
    }

    pub fn set_last_stream_token(&self, stream_token: &[u8]) -> FirestoreResult<()> {
        let components = self.components();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                components.mutation_queue.set_last_stream_token(txn, stream_token)
            })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_last_remote_snapshot_version(txn)
            })
    }

    /// Persists a consistent watch snapshot and returns the local views of
    /// every document it changed.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let components = self.components();
        let remote_version = event.snapshot_version;
        let known_targets = self.state().target_data_by_target.clone();

        let (documents, updated_targets) = self.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let mut updated_targets = BTreeMap::new();
                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = known_targets.get(target_id) else {
                        continue;
                    };
                    self.target_cache
                        .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    self.target_cache
                        .add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut new_target_data = old_target_data
                        .clone()
                        .with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    let change_count = change.added_documents.len()
                        + change.modified_documents.len()
                        + change.removed_documents.len();
                    if should_persist_target_data(old_target_data, &new_target_data, change_count) {
                        self.target_cache.update_target_data(txn, &new_target_data)?;
                    }
                    updated_targets.insert(*target_id, new_target_data);
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        txn.reference_delegate().update_limbo_document(txn, key)?;
                    }
                }

                let mut buffer = self.remote_documents.new_change_buffer();
                let (changed, existence_changed) =
                    populate_document_change_buffer(txn, &mut buffer, &event.document_updates, remote_version)?;
                buffer.apply(txn)?;

                if !remote_version.is_min() {
                    let last = self.target_cache.get_last_remote_snapshot_version(txn)?;
                    if remote_version < last {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot {remote_version} < {last}"
                        )));
                    }
                    let sequence_number = txn.current_sequence_number();
                    self.target_cache
                        .set_targets_metadata(txn, sequence_number, Some(remote_version))?;
                }

                let documents = components
                    .local_documents
                    .get_local_view_of_documents(txn, changed, &existence_changed)?;
                Ok((documents, updated_targets))
            },
        )?;

        self.state().target_data_by_target.extend(updated_targets);
        Ok(documents)
    }

    /// Pins the keys views now show and records which targets became
    /// limbo free.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        {
            let mut references = self
                .local_view_references
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for change in view_changes {
                references.add_references(change.added_keys.iter().cloned(), change.target_id);
                references.remove_references(&change.removed_keys, change.target_id);
            }
        }

        let mut limbo_free = Vec::new();
        {
            let state = self.state();
            for change in view_changes.iter().filter(|change| !change.from_cache) {
                let target_data = state.target_data_by_target.get(&change.target_id).ok_or_else(|| {
                    internal_error(format!("Can't set limbo-free snapshot version for unknown target {}", change.target_id))
                })?;
                let snapshot_version = target_data.snapshot_version;
                limbo_free.push(
                    target_data
                        .clone()
                        .with_last_limbo_free_snapshot_version(snapshot_version),
                );
            }
        }

        let result = self
            .persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                let delegate = txn.reference_delegate();
                for change in view_changes {
                    for key in &change.added_keys {
                        delegate.add_reference(txn, change.target_id, key)?;
                    }
                    for key in &change.removed_keys {
                        delegate.remove_reference(txn, change.target_id, key)?;
                    }
                }
                for target_data in &limbo_free {
                    self.target_cache.update_target_data(txn, target_data)?;
                }
                Ok(())
            });
        match result {
            Err(err) if is_primary_lease_lost(&err) => {
                log::debug!("ignoring lost lease while notifying local view changes: {err}");
            }
            other => other?,
        }

        let mut state = self.state();
        for target_data in limbo_free {
            state.target_data_by_target.insert(target_data.target_id, target_data);
        }
        Ok(())
    }

    /// The first pending batch after `after_batch_id`, or the oldest batch.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let components = self.components();
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                components
                    .mutation_queue
                    .get_next_mutation_batch_after_batch_id(txn, after_batch_id.unwrap_or(BATCH_ID_UNKNOWN))
            })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let components = self.components();
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                components.local_documents.get_document(txn, key)
            })
    }

    /// Returns the target's data, creating and persisting it on first use.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = self.target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = self.target_cache.allocate_target_id(txn)?;
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                self.target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })?;

        let mut state = self.state();
        let newer = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if newer {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Active target data for `target`, falling back to the target cache.
    pub fn get_local_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.active_target_data(target) {
            return Ok(Some(target_data));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_target_data(txn, target)
            })
    }

    fn active_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.state();
        let target_id = state.target_id_by_canonical_id.get(&target.canonical_id())?;
        state
            .target_data_by_target
            .get(target_id)
            .filter(|target_data| &target_data.target == target)
            .cloned()
    }

    /// Stops tracking `target_id`. Unless `keep_persisted_target_data` is
    /// set (another client still listens), the reference delegate gets to
    /// drop or age the persisted target.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let target_data = {
            let mut state = self.state();
            let target_data = state
                .target_data_by_target
                .remove(&target_id)
                .ok_or_else(|| internal_error(format!("Tried to release nonexistent target {target_id}")))?;
            let canonical_id = target_data.target.canonical_id();
            if state.target_id_by_canonical_id.get(&canonical_id) == Some(&target_id) {
                state.target_id_by_canonical_id.remove(&canonical_id);
            }
            target_data
        };
        let released_keys = self
            .local_view_references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_references_for_id(target_id);
        if keep_persisted_target_data {
            return Ok(());
        }

        let result = self
            .persistence
            .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                let delegate = txn.reference_delegate();
                for key in &released_keys {
                    delegate.remove_reference(txn, target_id, key)?;
                }
                delegate.remove_target(txn, &target_data)
            });
        match result {
            Err(err) if is_primary_lease_lost(&err) || is_transient_storage_error(&err) => {
                log::debug!("failed to update sequence numbers for target {target_id}: {err}");
                Ok(())
            }
            other => other,
        }
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// query engine may start from the target's last limbo-free results.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let (components, query_engine) = {
            let state = self.state();
            (state.components.clone(), state.query_engine.clone())
        };
        let target = query.to_target();
        let active = self.active_target_data(&target);

        let result = self
            .persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let target_data = match &active {
                    Some(target_data) => Some(target_data.clone()),
                    None => self.target_cache.get_target_data(txn, &target)?,
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        self.target_cache
                            .get_matching_keys_for_target_id(txn, target_data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let empty = BTreeSet::new();
                let documents = query_engine.get_documents_matching_query(
                    txn,
                    &components.local_documents,
                    &components.index_manager,
                    query,
                    if use_previous_results { last_limbo_free } else { SnapshotVersion::min() },
                    if use_previous_results { &remote_keys } else { &empty },
                )?;
                Ok(QueryResult { documents, remote_keys })
            })?;

        let collection_group = query
            .collection_group_id()
            .map(str::to_string)
            .or_else(|| query.path().last_segment().map(str::to_string));
        if let Some(group) = collection_group {
            self.set_max_read_time(&group, result.documents.values());
        }
        Ok(result)
    }

    fn set_max_read_time<'d>(&self, collection_group: &str, documents: impl Iterator<Item = &'d Document>) {
        let mut state = self.state();
        let read_time = state
            .collection_group_read_time
            .entry(collection_group.to_string())
            .or_insert_with(SnapshotVersion::min);
        for document in documents {
            if document.read_time() > *read_time {
                *read_time = document.read_time();
            }
        }
    }

    pub fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Get remote document keys", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
    }

    /// Documents of `collection_group` cached since the last call, used
    /// when another client reports new documents.
    pub fn get_new_document_changes(&self, collection_group: &str) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let read_time = self
            .state()
            .collection_group_read_time
            .get(collection_group)
            .copied()
            .unwrap_or_else(SnapshotVersion::min);
        let documents = self
            .persistence
            .run_transaction("Get new document changes", TransactionMode::ReadOnly, |txn| {
                self.remote_documents.get_all_from_collection_group(
                    txn,
                    collection_group,
                    &IndexOffset::successor_of_read_time(read_time, INITIAL_LARGEST_BATCH_ID),
                    usize::MAX,
                )
            })?;
        self.set_max_read_time(collection_group, documents.values());
        Ok(documents)
    }

    /// Collection groups seen by queries or document changes so far.
    pub fn known_collection_groups(&self) -> Vec<String> {
        self.state().collection_group_read_time.keys().cloned().collect()
    }

    pub fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let active_target_ids: BTreeSet<TargetId> = self.state().target_data_by_target.keys().copied().collect();
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                collector.collect(txn, &active_target_ids)
            })
    }

    pub fn backfill_indexes(&self, backfiller: &IndexBackfiller) -> FirestoreResult<usize> {
        let components = self.components();
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
                backfiller.write_index_entries(txn, &components.index_manager, &components.local_documents)
            })
    }

    /// Target data by id, for targets another client started.
    pub fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.state().target_data_by_target.get(&target_id) {
            return Ok(Some(target_data.clone()));
        }
        self.persistence
            .run_transaction("Get cached target", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_target_data_for_target_id(txn, target_id)
            })
    }

    /// Local views of the documents a batch touched, or `None` if the batch
    /// is gone.
    pub fn lookup_mutation_documents(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        let components = self.components();
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadWrite, |txn| {
                match components.mutation_queue.lookup_mutation_batch(txn, batch_id)? {
                    Some(batch) => components
                        .local_documents
                        .get_documents(txn, &batch.keys())
                        .map(Some),
                    None => Ok(None),
                }
            })
    }

    /// Replaces the configured field indexes with `indexes`, keeping the
    /// entries of indexes that did not change.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let index_manager = self.index_manager();
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = index_manager.get_field_indexes(txn, None)?;
                for index in &existing {
                    if !indexes.iter().any(|wanted| wanted.semantic_compare(index).is_eq()) {
                        index_manager.delete_field_index(txn, index)?;
                    }
                }
                for index in &indexes {
                    if !existing.iter().any(|current| current.semantic_compare(index).is_eq()) {
                        index_manager.add_field_index(txn, index)?;
                    }
                }
                Ok(())
            })
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        self.state().query_engine.set_index_auto_creation_enabled(enabled);
    }

    pub fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        let index_manager = self.index_manager();
        self.persistence
            .run_transaction("Delete all indexes", TransactionMode::ReadWrite, |txn| {
                index_manager.delete_all_field_indexes(txn)
            })
    }

    /// Whether a bundle with the same id and an equal or newer create time
    /// was already loaded.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence
            .run_transaction("Has newer bundle", TransactionMode::ReadOnly, |txn| {
                Ok(self
                    .bundle_cache
                    .get_bundle_metadata(txn, &metadata.id)?
                    .is_some_and(|cached| cached.create_time >= metadata.create_time))
            })
    }

    pub fn save_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", TransactionMode::ReadWrite, |txn| {
                self.bundle_cache.save_bundle_metadata(txn, metadata)
            })
    }

    /// Writes bundled documents into the remote document cache, pinned by an
    /// umbrella target so they survive garbage collection until a listener
    /// picks them up. Returns the changed local views.
    pub fn load_bundle_documents(
        &self,
        bundle_name: &str,
        documents: Vec<Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let components = self.components();
        let umbrella = Query::at_path(ResourcePath::from_string(&format!("__bundle__/docs/{bundle_name}"))?);
        let umbrella_target = self.allocate_target(umbrella.to_target())?;
        let updates: BTreeMap<DocumentKey, Document> = documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        let keys: BTreeSet<DocumentKey> = updates.keys().cloned().collect();

        self.persistence
            .run_transaction("Apply bundle documents", TransactionMode::ReadWrite, |txn| {
                let mut buffer = self.remote_documents.new_change_buffer();
                let (changed, existence_changed) =
                    populate_document_change_buffer(txn, &mut buffer, &updates, SnapshotVersion::min())?;
                buffer.apply(txn)?;
                self.target_cache
                    .remove_matching_keys_for_target_id(txn, umbrella_target.target_id)?;
                self.target_cache
                    .add_matching_keys(txn, &keys, umbrella_target.target_id)?;
                components
                    .local_documents
                    .get_local_view_of_documents(txn, changed, &existence_changed)
            })
    }

    /// Saves a bundled query and, when the bundle is newer than the cached
    /// target, resets the target's results to `documents`.
    pub fn save_named_query(&self, query: &NamedQuery, documents: &BTreeSet<DocumentKey>) -> FirestoreResult<()> {
        let allocated = self.allocate_target(query.query.to_target())?;
        let updated = self
            .persistence
            .run_transaction("Save named query", TransactionMode::ReadWrite, |txn| {
                if allocated.snapshot_version >= query.read_time {
                    self.bundle_cache.save_named_query(txn, query)?;
                    return Ok(None);
                }
                let updated = allocated.clone().with_resume_token(Vec::new(), query.read_time);
                self.target_cache.update_target_data(txn, &updated)?;
                self.target_cache
                    .remove_matching_keys_for_target_id(txn, allocated.target_id)?;
                self.target_cache
                    .add_matching_keys(txn, documents, allocated.target_id)?;
                self.bundle_cache.save_named_query(txn, query)?;
                Ok(Some(updated))
            })?;
        if let Some(updated) = updated {
            self.state()
                .target_data_by_target
                .insert(updated.target_id, updated);
        }
        Ok(())
    }

    pub fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.persistence
            .run_transaction("Get named query", TransactionMode::ReadOnly, |txn| {
                self.bundle_cache.get_named_query(txn, name)
            })
    }

    /// Ids of every target this client tracks.
    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.state().target_data_by_target.keys().copied().collect()
    }
}

fn keys_with_transform_results(result: &MutationBatchResult) -> BTreeSet<DocumentKey> {
    result
        .batch
        .mutations
        .iter()
        .zip(&result.mutation_results)
        .filter(|(_, mutation_result)| !mutation_result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key.clone())
        .collect()
}

/// Writes `updates` that are newer than the cached documents into
/// `buffer`. Returns the changed documents and the keys whose existence
/// flipped.
fn populate_document_change_buffer(
    txn: &PersistenceTransaction<'_, '_>,
    buffer: &mut RemoteDocumentChangeBuffer,
    updates: &BTreeMap<DocumentKey, Document>,
    read_time: SnapshotVersion,
) -> FirestoreResult<(BTreeMap<DocumentKey, Document>, BTreeSet<DocumentKey>)> {
    let existing = buffer.get_entries(txn, updates.keys())?;
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();
    for (key, document) in updates {
        let mut document = document.clone();
        if document.read_time().is_min() && !read_time.is_min() {
            document.set_read_time(read_time);
        }
        let Some(cached) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != cached.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // A deleted document without a version only says "don't know";
            // drop the cached copy.
            buffer.remove_entry(key.clone(), document.read_time());
            changed.insert(key.clone(), document);
        } else if !cached.is_valid_document()
            || document.version() > cached.version()
            || (document.version() == cached.version() && cached.has_pending_writes())
        {
            buffer.add_entry(document.clone());
            changed.insert(key.clone(), document);
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current version {}, watch version {}",
                cached.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change_count: usize) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change_count > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::{FieldPath, MutationResult};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        data
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    async fn local_store() -> Arc<LocalStore> {
        let store = LocalStore::new(test_persistence().await, User::unauthenticated(), IndexAutoCreationSettings::default());
        store.start().unwrap();
        store
    }

    #[tokio::test]
    async fn acknowledged_writes_lose_their_pending_flag() {
        let store = local_store().await;
        let write = store
            .write_locally(vec![Mutation::set(key("rooms/eros"), data("size", 3))])
            .unwrap();
        assert_eq!(write.batch_id, 1);
        let local = &write.changes[&key("rooms/eros")];
        assert!(local.has_local_mutations());
        assert_eq!(store.get_highest_unacknowledged_batch_id().unwrap(), 1);

        let batch = store.next_mutation_batch(None).unwrap().unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(10),
            vec![MutationResult {
                version: version(10),
                transform_results: Vec::new(),
            }],
            b"token".to_vec(),
        )
        .unwrap();
        let acknowledged = store.acknowledge_batch(&result).unwrap();
        let document = &acknowledged[&key("rooms/eros")];
        assert!(!document.has_local_mutations());
        assert!(document.has_committed_mutations());
        assert_eq!(document.version(), version(10));
        assert_eq!(store.get_highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
        assert_eq!(store.get_last_stream_token().unwrap(), b"token".to_vec());
    }

    #[tokio::test]
    async fn rejected_writes_revert_the_local_view() {
        let store = local_store().await;
        let write = store
            .write_locally(vec![Mutation::set(key("rooms/eros"), data("size", 3))])
            .unwrap();
        assert!(store.read_document(&key("rooms/eros")).unwrap().is_found_document());

        let reverted = store.reject_batch(write.batch_id).unwrap();
        assert!(!reverted[&key("rooms/eros")].is_valid_document());
        assert!(!store.read_document(&key("rooms/eros")).unwrap().is_valid_document());
        assert!(store.reject_batch(write.batch_id).is_err());
    }

    #[tokio::test]
    async fn remote_events_update_active_targets() {
        let store = local_store().await;
        let query = Query::collection("rooms").unwrap();
        let target_data = store.allocate_target(query.to_target()).unwrap();
        assert_eq!(
            store.allocate_target(query.to_target()).unwrap().target_id,
            target_data.target_id
        );

        let mut document = Document::new_found(key("rooms/eros"), version(5), data("size", 3));
        document.set_read_time(version(5));
        let mut event = RemoteEvent {
            snapshot_version: version(5),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            target_data.target_id,
            crate::firestore::remote::TargetChange {
                resume_token: b"resume".to_vec(),
                current: true,
                added_documents: BTreeSet::from([key("rooms/eros")]),
                ..Default::default()
            },
        );
        event.document_updates.insert(key("rooms/eros"), document);

        let changed = store.apply_remote_event(&event).unwrap();
        assert!(changed[&key("rooms/eros")].is_found_document());
        assert_eq!(store.get_last_remote_snapshot_version().unwrap(), version(5));
        assert_eq!(
            store.get_remote_document_keys(target_data.target_id).unwrap(),
            BTreeSet::from([key("rooms/eros")])
        );

        let result = store.execute_query(&query, true).unwrap();
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.remote_keys, BTreeSet::from([key("rooms/eros")]));

        store.release_target(target_data.target_id, false).unwrap();
        assert!(store.active_target_ids().is_empty());
        assert!(store.release_target(target_data.target_id, false).is_err());
    }

    #[tokio::test]
    async fn user_change_swaps_mutation_queues() {
        let store = local_store().await;
        store
            .write_locally(vec![Mutation::set(key("rooms/eros"), data("size", 3))])
            .unwrap();

        let change = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(change.removed_batch_ids, vec![1]);
        assert!(change.added_batch_ids.is_empty());
        assert!(!change.affected_documents[&key("rooms/eros")].is_valid_document());

        let change = store.handle_user_change(User::unauthenticated()).unwrap();
        assert_eq!(change.added_batch_ids, vec![1]);
        assert!(change.affected_documents[&key("rooms/eros")].is_found_document());
    }
}
