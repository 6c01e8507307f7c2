//! The sync engine binds queries to targets and keeps views up to date.
//!
//! Local writes, remote events and changes reported by other clients all
//! flow through here: the engine applies them to the [`LocalStore`],
//! recomputes every affected [`View`] and hands the resulting snapshots to
//! the [`EventManager`]. It also resolves limbo documents by listening to
//! them one at a time, up to the configured concurrency.
//!
//! Calls into the [`RemoteStore`] and observer callbacks are collected
//! while the engine's state is locked and run after it is released, since
//! the remote store calls back into the engine synchronously.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::channel::oneshot;

use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, QueryListener, RaisedEvents, SnapshotObserver, SnapshotsInSyncObserver,
};
use crate::firestore::core::listen_sequence::INVALID_SEQUENCE_NUMBER;
use crate::firestore::core::online_state::OnlineState;
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::credentials::User;
use crate::firestore::error::{cancelled, internal_error, is_primary_lease_lost, FirestoreError, FirestoreResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::shared_client_state::{
    MutationBatchState, QueryTargetState, SharedClientState, SharedClientStateSyncer,
};
use crate::firestore::local::{Bundle, LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatchResult, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};

/// Resolves once the backend accepted or rejected a write.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl PendingWrite {
    fn new(batch_id: BatchId, receiver: oneshot::Receiver<FirestoreResult<()>>) -> Self {
        Self { batch_id, receiver }
    }

    /// Id of the batch being waited for, `BATCH_ID_UNKNOWN` when nothing
    /// was pending.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub async fn wait(self) -> FirestoreResult<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("The client was shut down before the write completed")),
        }
    }
}

/// Outcome of [`SyncEngine::load_bundle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadBundleResult {
    pub documents_loaded: usize,
    /// The same or a newer version of the bundle was loaded before.
    pub skipped: bool,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target delivered the document. A later removal
    /// means the document was deleted.
    received_document: bool,
}

enum RemoteCall {
    Listen(TargetData),
    Unlisten(TargetId),
    FillWritePipeline,
    ApplyPrimaryState(bool),
}

/// Work produced while the state lock is held.
#[derive(Default)]
struct Followups {
    remote: Vec<RemoteCall>,
    events: RaisedEvents,
}

struct SyncEngineState {
    current_user: User,
    /// Unknown until persistence reports the first lease state.
    is_primary: Option<bool>,
    online_state: OnlineState,
    event_manager: EventManager,
    next_listener_id: u64,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_ids: TargetIdGenerator,
    mutation_callbacks: BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>,
    /// Keys written by this client's batches, kept until the batch
    /// completes so another client's acknowledgement can still be applied
    /// after the batch left the queue.
    mutation_keys: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
}

impl SyncEngineState {
    fn is_primary(&self) -> bool {
        self.is_primary == Some(true)
    }
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    /// Creates the engine and registers it with the remote store and the
    /// shared client state.
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        shared_client_state: Arc<dyn SharedClientState>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store,
            shared_client_state,
            max_concurrent_limbo_resolutions,
            state: Mutex::new(SyncEngineState {
                current_user,
                is_primary: None,
                online_state: OnlineState::Unknown,
                event_manager: EventManager::new(),
                next_listener_id: 0,
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_ids: TargetIdGenerator::for_sync_engine(),
                mutation_callbacks: BTreeMap::new(),
                mutation_keys: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
        });
        let remote_syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&engine) as Weak<SyncEngine>;
        engine.remote_store.set_syncer(remote_syncer);
        let shared_syncer: Weak<dyn SharedClientStateSyncer> = Arc::downgrade(&engine) as Weak<SyncEngine>;
        engine.shared_client_state.set_syncer(shared_syncer);
        engine
    }

    pub fn is_primary_client(&self) -> bool {
        self.state().is_primary()
    }

    pub fn online_state(&self) -> OnlineState {
        self.state().online_state
    }

    pub fn current_user(&self) -> User {
        self.state().current_user.clone()
    }

    /// Registers `observer` for `query`. The first listener of a query
    /// allocates its target and starts listening to it remotely. Failures
    /// to start the listen are delivered to the observer.
    pub fn listen(&self, query: Query, options: ListenOptions, observer: SnapshotObserver) -> FirestoreResult<u64> {
        let mut out = Followups::default();
        let listener_id = {
            let mut guard = self.state();
            let st = &mut *guard;
            st.next_listener_id += 1;
            let listener_id = st.next_listener_id;
            let listener = QueryListener::new(listener_id, query.clone(), options, observer);
            let initial = if st.event_manager.is_first_listen(&query) {
                self.listen_to_query(st, &query, true, &mut out).map(Some)
            } else {
                Ok(None)
            };
            match initial {
                Ok(initial) => st.event_manager.add_listener(listener, initial, &mut out.events),
                Err(err) => {
                    log::warn!("failed to listen to {}: {err}", query.canonical_id());
                    EventManager::reject_listener(&listener, err, &mut out.events);
                }
            }
            listener_id
        };
        self.finish(out)?;
        Ok(listener_id)
    }

    /// Removes a listener; the last one for a query releases its target.
    pub fn unlisten(&self, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if st.event_manager.remove_listener(query, listener_id) {
                self.unlisten_from_query(st, query, true, &mut out)?;
            }
        }
        self.finish(out)
    }

    pub fn add_snapshots_in_sync_listener(&self, observer: SnapshotsInSyncObserver) -> u64 {
        let mut events = RaisedEvents::default();
        let id = {
            let mut st = self.state();
            st.next_listener_id += 1;
            let id = st.next_listener_id;
            st.event_manager
                .add_snapshots_in_sync_listener(id, observer, &mut events);
            id
        };
        events.deliver();
        id
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        self.state()
            .event_manager
            .remove_snapshots_in_sync_listener(id);
    }

    /// Applies `mutations` locally and queues them for the backend.
    pub fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let (sender, receiver) = oneshot::channel();
        let mut out = Followups::default();
        let batch_id = {
            let mut guard = self.state();
            let st = &mut *guard;
            let result = self.local_store.write_locally(mutations)?;
            self.shared_client_state.add_pending_mutation(result.batch_id);
            st.mutation_callbacks.insert(result.batch_id, sender);
            st.mutation_keys
                .insert(result.batch_id, result.changes.keys().cloned().collect());
            self.emit_new_snaps_and_notify_local_store(st, result.changes, None, &mut out)?;
            out.remote.push(RemoteCall::FillWritePipeline);
            result.batch_id
        };
        self.finish(out)?;
        Ok(PendingWrite::new(batch_id, receiver))
    }

    /// Resolves once every batch pending right now was acknowledged or
    /// rejected. Rejected with `Cancelled` if the user changes first.
    pub fn wait_for_pending_writes(&self) -> FirestoreResult<PendingWrite> {
        if !self.remote_store.can_use_network() {
            log::debug!("network is disabled; pending writes complete once it is enabled");
        }
        let highest = self.local_store.get_highest_unacknowledged_batch_id()?;
        let (sender, receiver) = oneshot::channel();
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.state()
                .pending_writes_callbacks
                .entry(highest)
                .or_default()
                .push(sender);
        }
        Ok(PendingWrite::new(highest, receiver))
    }

    /// Loads a bundle's documents and named queries into the cache.
    pub fn load_bundle(&self, bundle: Bundle) -> FirestoreResult<LoadBundleResult> {
        if self.local_store.has_newer_bundle(&bundle.metadata)? {
            log::debug!("bundle {} was already loaded", bundle.metadata.id);
            return Ok(LoadBundleResult {
                documents_loaded: 0,
                skipped: true,
            });
        }
        let documents_loaded = bundle.documents.len();
        let collection_groups: BTreeSet<String> = bundle
            .documents
            .iter()
            .map(|bundled| bundled.document.key().collection_group().to_string())
            .collect();

        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let documents = bundle
                .documents
                .iter()
                .map(|bundled| bundled.document.clone())
                .collect();
            let changes = self
                .local_store
                .load_bundle_documents(&bundle.metadata.id, documents)?;
            for named_query in &bundle.named_queries {
                let keys: BTreeSet<DocumentKey> = bundle
                    .documents
                    .iter()
                    .filter(|bundled| bundled.queries.contains(&named_query.name))
                    .map(|bundled| bundled.document.key().clone())
                    .collect();
                self.local_store.save_named_query(named_query, &keys)?;
            }
            self.local_store.save_bundle(&bundle.metadata)?;
            self.emit_new_snaps_and_notify_local_store(st, changes, None, &mut out)?;
        }
        self.shared_client_state
            .notify_bundle_loaded(&collection_groups);
        self.finish(out)?;
        Ok(LoadBundleResult {
            documents_loaded,
            skipped: false,
        })
    }

    /// Reacts to gaining or losing the primary lease. A new primary takes
    /// over every target any client listens to; a demoted client keeps only
    /// its own views and stops using the network.
    pub fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if is_primary && st.is_primary != Some(true) {
                log::debug!("sync engine became primary");
                let active_targets: Vec<TargetId> = self
                    .shared_client_state
                    .get_all_active_query_targets()
                    .into_iter()
                    .collect();
                let active_queries = self.synchronize_query_views_and_raise_snapshots(st, active_targets, &mut out)?;
                st.is_primary = Some(true);
                out.remote.push(RemoteCall::ApplyPrimaryState(true));
                out.remote
                    .extend(active_queries.into_iter().map(RemoteCall::Listen));
            } else if !is_primary && st.is_primary != Some(false) {
                log::debug!("sync engine became secondary");
                let mut active_targets = Vec::new();
                let target_ids: Vec<TargetId> = st.queries_by_target.keys().copied().collect();
                for target_id in target_ids {
                    if self.shared_client_state.is_local_query_target(target_id) {
                        active_targets.push(target_id);
                    } else {
                        self.remove_and_cleanup_target(st, target_id, None, &mut out);
                        self.local_store.release_target(target_id, true)?;
                    }
                    out.remote.push(RemoteCall::Unlisten(target_id));
                }
                self.synchronize_query_views_and_raise_snapshots(st, active_targets, &mut out)?;
                self.reset_limbo_documents(st, &mut out);
                st.is_primary = Some(false);
                out.remote.push(RemoteCall::ApplyPrimaryState(false));
            }
        }
        self.finish(out)
    }

    /// Online state reported by the primary through the shared state.
    pub fn apply_shared_online_state(&self, online_state: OnlineState) {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if !st.is_primary() {
                apply_online_state(st, online_state, &mut out);
            }
        }
        out.events.deliver();
    }

    /// Rejects every outstanding write callback.
    pub fn shutdown(&self) {
        let mut st = self.state();
        for (_, sender) in std::mem::take(&mut st.mutation_callbacks) {
            let _ = sender.send(Err(cancelled("The client was shut down")));
        }
        reject_pending_writes_callbacks(&mut st, "The client was shut down");
    }

    /// Limbo documents currently being resolved, with their target ids.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    fn listen_to_query(
        &self,
        st: &mut SyncEngineState,
        query: &Query,
        should_listen_to_remote: bool,
        out: &mut Followups,
    ) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = st.query_views.get(&query.canonical_id()) {
            self.shared_client_state
                .add_local_query_target(query_view.target_id, true);
            return Ok(query_view.view.compute_initial_snapshot());
        }
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id, should_listen_to_remote);
        let snapshot = self.initialize_view_and_compute_snapshot(
            st,
            query,
            target_data.target_id,
            status == QueryTargetState::Current,
            target_data.resume_token.clone(),
            out,
        )?;
        if st.is_primary() && should_listen_to_remote {
            out.remote.push(RemoteCall::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        st: &mut SyncEngineState,
        query: &Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
        out: &mut Followups,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange::synthesized_for_current_change(
            current && st.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, st.is_primary(), Some(&synthesized), false);
        self.update_tracked_limbos(st, target_id, view_change.limbo_changes, out);
        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());

        st.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        st.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        Ok(snapshot)
    }

    fn unlisten_from_query(
        &self,
        st: &mut SyncEngineState,
        query: &Query,
        should_unlisten_remote: bool,
        out: &mut Followups,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = st.query_views.get(&canonical_id).map(|view| view.target_id) else {
            return Err(internal_error(format!("Trying to unlisten on query not found: {canonical_id}")));
        };
        if let Some(queries) = st.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|existing| existing.canonical_id() != canonical_id);
                st.query_views.remove(&canonical_id);
                return Ok(());
            }
        }

        if st.is_primary() {
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.shared_client_state.clear_query_state(target_id);
                    if should_unlisten_remote {
                        out.remote.push(RemoteCall::Unlisten(target_id));
                    }
                    self.remove_and_cleanup_target(st, target_id, None, out);
                    Ok(())
                }
                Err(err) => ignore_if_primary_lease_loss(err),
            }
        } else {
            self.remove_and_cleanup_target(st, target_id, None, out);
            self.local_store.release_target(target_id, true)
        }
    }

    fn remove_and_cleanup_target(
        &self,
        st: &mut SyncEngineState,
        target_id: TargetId,
        error: Option<FirestoreError>,
        out: &mut Followups,
    ) {
        self.shared_client_state.remove_local_query_target(target_id);
        if let Some(queries) = st.queries_by_target.remove(&target_id) {
            for query in queries {
                st.query_views.remove(&query.canonical_id());
                if let Some(error) = &error {
                    st.event_manager
                        .on_watch_error(&query, error.clone(), &mut out.events);
                }
            }
        }
        if !st.is_primary() {
            return;
        }
        let limbo_keys = st.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !st.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(st, &key, out);
            }
        }
    }

    /// Runs `changes` through every view, publishes the snapshots and pins
    /// the documents the views now show.
    fn emit_new_snaps_and_notify_local_store(
        &self,
        st: &mut SyncEngineState,
        changes: BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
        out: &mut Followups,
    ) -> FirestoreResult<()> {
        let is_primary = st.is_primary();
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_changes = Vec::new();

        for query_view in st.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(&changes, None);
            if doc_changes.needs_refill {
                // A limit query lost a document at its edge.
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes));
            }
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(doc_changes, is_primary, target_change, pending_reset);
            limbo_changes.push((target_id, view_change.limbo_changes));

            if let Some(snapshot) = view_change.snapshot {
                if is_primary {
                    let state = if snapshot.from_cache {
                        QueryTargetState::NotCurrent
                    } else {
                        QueryTargetState::Current
                    };
                    self.shared_client_state
                        .update_query_state(target_id, state, None);
                }
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, changes) in limbo_changes {
            self.update_tracked_limbos(st, target_id, changes, out);
        }
        st.event_manager.on_watch_change(snapshots, &mut out.events);
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn update_tracked_limbos(
        &self,
        st: &mut SyncEngineState,
        target_id: TargetId,
        changes: Vec<LimboDocumentChange>,
        out: &mut Followups,
    ) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    st.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(st, key, out);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    st.limbo_document_refs.remove_reference(&key, target_id);
                    if !st.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(st, &key, out);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&self, st: &mut SyncEngineState, key: DocumentKey, out: &mut Followups) {
        if !st.active_limbo_targets_by_key.contains_key(&key) && !st.enqueued_limbo_resolutions.contains(&key) {
            log::debug!("new document in limbo: {key}");
            st.enqueued_limbo_resolutions.push_back(key);
        }
        self.pump_enqueued_limbo_resolutions(st, out);
    }

    /// Starts listens for enqueued limbo documents while below the
    /// concurrency limit.
    fn pump_enqueued_limbo_resolutions(&self, st: &mut SyncEngineState, out: &mut Followups) {
        while st.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = st.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = st.limbo_target_ids.next();
            log::debug!("resolving limbo document {key} with target {target_id}");
            st.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            st.active_limbo_targets_by_key.insert(key.clone(), target_id);
            out.remote.push(RemoteCall::Listen(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&self, st: &mut SyncEngineState, key: &DocumentKey, out: &mut Followups) {
        st.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        let Some(target_id) = st.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        out.remote.push(RemoteCall::Unlisten(target_id));
        st.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions(st, out);
    }

    fn reset_limbo_documents(&self, st: &mut SyncEngineState, out: &mut Followups) {
        for &target_id in st.active_limbo_resolutions_by_target.keys() {
            out.remote.push(RemoteCall::Unlisten(target_id));
        }
        st.limbo_document_refs.remove_all_references();
        st.active_limbo_resolutions_by_target.clear();
        st.active_limbo_targets_by_key.clear();
        st.enqueued_limbo_resolutions.clear();
    }

    /// Re-reads every view of `target_ids` from the cache. Returns the
    /// target data to listen to once this client is primary.
    fn synchronize_query_views_and_raise_snapshots(
        &self,
        st: &mut SyncEngineState,
        target_ids: Vec<TargetId>,
        out: &mut Followups,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut snapshots = Vec::new();
        let mut active_queries = Vec::new();
        for target_id in target_ids {
            let queries = st
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            let target_data = match queries.first() {
                Some(first) => {
                    let target_data = self.local_store.allocate_target(first.to_target())?;
                    for query in &queries {
                        let Some(query_view) = st.query_views.get_mut(&query.canonical_id()) else {
                            continue;
                        };
                        let result = self.local_store.execute_query(&query_view.query, true)?;
                        if let Some(snapshot) = query_view.view.synchronize_with_persisted_state(result).snapshot {
                            snapshots.push(snapshot);
                        }
                    }
                    target_data
                }
                None => {
                    let Some(cached) = self.local_store.get_cached_target(target_id)? else {
                        log::debug!("no cached target for active target {target_id}");
                        continue;
                    };
                    let target_data = self.local_store.allocate_target(cached.target.clone())?;
                    self.initialize_view_and_compute_snapshot(
                        st,
                        &Query::from_target(&cached.target),
                        target_data.target_id,
                        false,
                        target_data.resume_token.clone(),
                        out,
                    )?;
                    target_data
                }
            };
            active_queries.push(target_data);
        }
        st.event_manager.on_watch_change(snapshots, &mut out.events);
        Ok(active_queries)
    }

    fn apply_remote_event_locked(
        &self,
        st: &mut SyncEngineState,
        event: &RemoteEvent,
        out: &mut Followups,
    ) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = st.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let total =
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
            if total > 1 {
                return Err(internal_error("Limbo resolution for single document contains multiple changes"));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received change for limbo target document without add"));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error("Received remove for limbo target document without add"));
                }
                resolution.received_document = false;
            }
        }
        let changes = match self.local_store.apply_remote_event(event) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        self.emit_new_snaps_and_notify_local_store(st, changes, Some(event), out)
    }

    fn process_user_callback(&self, st: &mut SyncEngineState, batch_id: BatchId, result: FirestoreResult<()>) {
        st.mutation_keys.remove(&batch_id);
        if let Some(sender) = st.mutation_callbacks.remove(&batch_id) {
            let _ = sender.send(result);
        }
    }

    fn finish(&self, followups: Followups) -> FirestoreResult<()> {
        let Followups { remote, events } = followups;
        let mut result = Ok(());
        for call in remote {
            let outcome = match call {
                RemoteCall::Listen(target_data) => self.remote_store.listen(target_data),
                RemoteCall::Unlisten(target_id) => self.remote_store.unlisten(target_id),
                RemoteCall::FillWritePipeline => self.remote_store.fill_write_pipeline(),
                RemoteCall::ApplyPrimaryState(is_primary) => self.remote_store.apply_primary_state(is_primary),
            };
            if let Err(err) = outcome {
                result = Err(err);
                break;
            }
        }
        events.deliver();
        result
    }

    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            self.apply_remote_event_locked(&mut guard, &event, &mut out)?;
        }
        self.finish(out)
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            self.shared_client_state
                .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));
            let limbo_key = st
                .active_limbo_resolutions_by_target
                .get(&target_id)
                .map(|resolution| resolution.key.clone());
            match limbo_key {
                Some(key) => {
                    // The backend refused to tell us about the document, so
                    // treat it as deleted.
                    log::debug!("limbo resolution for {key} failed: {error}");
                    let mut event = RemoteEvent::default();
                    event.document_updates.insert(
                        key.clone(),
                        Document::new_no_document(key.clone(), SnapshotVersion::min()),
                    );
                    event.resolved_limbo_documents.insert(key.clone());
                    self.apply_remote_event_locked(st, &event, &mut out)?;
                    st.active_limbo_targets_by_key.remove(&key);
                    st.active_limbo_resolutions_by_target.remove(&target_id);
                    self.pump_enqueued_limbo_resolutions(st, &mut out);
                }
                None => match self.local_store.release_target(target_id, false) {
                    Ok(()) => self.remove_and_cleanup_target(st, target_id, Some(error), &mut out),
                    Err(err) => ignore_if_primary_lease_loss(err)?,
                },
            }
        }
        self.finish(out)
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            match self.local_store.acknowledge_batch(&result) {
                Ok(changes) => {
                    log::debug!("batch {batch_id} acknowledged");
                    self.process_user_callback(st, batch_id, Ok(()));
                    trigger_pending_writes_callbacks(st, batch_id);
                    self.shared_client_state
                        .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
                    self.emit_new_snaps_and_notify_local_store(st, changes, None, &mut out)?;
                }
                Err(err) => ignore_if_primary_lease_loss(err)?,
            }
        }
        self.finish(out)
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            match self.local_store.reject_batch(batch_id) {
                Ok(changes) => {
                    log::debug!("batch {batch_id} rejected: {error}");
                    self.process_user_callback(st, batch_id, Err(error.clone()));
                    trigger_pending_writes_callbacks(st, batch_id);
                    self.shared_client_state
                        .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error));
                    self.emit_new_snaps_and_notify_local_store(st, changes, None, &mut out)?;
                }
                Err(err) => ignore_if_primary_lease_loss(err)?,
            }
        }
        self.finish(out)
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let st = self.state();
        if let Some(resolution) = st.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
            return BTreeSet::new();
        }
        let mut keys = BTreeSet::new();
        for query in st.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = st.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn handle_credential_change(&self, user: &User) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if st.current_user == *user {
                return Ok(());
            }
            log::debug!("user changed to {:?}", user.uid());
            let result = self.local_store.handle_user_change(user.clone())?;
            st.current_user = user.clone();
            reject_pending_writes_callbacks(st, "'wait_for_pending_writes' was rejected because the user changed");
            self.shared_client_state
                .handle_user_change(user, &result.removed_batch_ids, &result.added_batch_ids);
            self.emit_new_snaps_and_notify_local_store(st, result.affected_documents, None, &mut out)?;
        }
        self.finish(out)
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if st.is_primary() {
                apply_online_state(st, online_state, &mut out);
                self.shared_client_state.set_online_state(online_state);
            }
        }
        out.events.deliver();
    }
}

impl SharedClientStateSyncer for SyncEngine {
    fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            let documents = match self.local_store.lookup_mutation_documents(batch_id)? {
                Some(documents) => documents,
                None => match st.mutation_keys.get(&batch_id) {
                    // Our own batch, already removed by the primary.
                    Some(keys) => {
                        let mut documents = BTreeMap::new();
                        for key in keys {
                            documents.insert(key.clone(), self.local_store.read_document(key)?);
                        }
                        documents
                    }
                    None => {
                        log::debug!("cannot apply state of unknown mutation batch {batch_id}");
                        return Ok(());
                    }
                },
            };
            match state {
                MutationBatchState::Pending => out.remote.push(RemoteCall::FillWritePipeline),
                MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                    let result = match error {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                    self.process_user_callback(st, batch_id, result);
                    trigger_pending_writes_callbacks(st, batch_id);
                }
            }
            self.emit_new_snaps_and_notify_local_store(st, documents, None, &mut out)?;
        }
        self.finish(out)
    }

    fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if st.is_primary() {
                log::debug!("ignoring query state notification for target {target_id} on the primary");
                return Ok(());
            }
            let Some(query) = st
                .queries_by_target
                .get(&target_id)
                .and_then(|queries| queries.first().cloned())
            else {
                return Ok(());
            };
            match state {
                QueryTargetState::Current | QueryTargetState::NotCurrent => {
                    let changes = self
                        .local_store
                        .get_new_document_changes(&collection_group_of(&query))?;
                    let event = RemoteEvent::synthesized_for_current_change(
                        target_id,
                        state == QueryTargetState::Current,
                        Vec::new(),
                    );
                    self.emit_new_snaps_and_notify_local_store(st, changes, Some(&event), &mut out)?;
                }
                QueryTargetState::Rejected => {
                    self.local_store.release_target(target_id, true)?;
                    self.remove_and_cleanup_target(st, target_id, error, &mut out);
                }
            }
        }
        self.finish(out)
    }

    fn apply_active_target_change(&self, added: Vec<TargetId>, removed: Vec<TargetId>) -> FirestoreResult<()> {
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            if !st.is_primary() {
                return Ok(());
            }
            for target_id in added {
                if st.queries_by_target.contains_key(&target_id) {
                    log::debug!("target {target_id} is already active");
                    continue;
                }
                let Some(cached) = self.local_store.get_cached_target(target_id)? else {
                    log::debug!("no cached target for {target_id} added by another client");
                    continue;
                };
                let target_data = self.local_store.allocate_target(cached.target.clone())?;
                self.initialize_view_and_compute_snapshot(
                    st,
                    &Query::from_target(&cached.target),
                    target_data.target_id,
                    false,
                    target_data.resume_token.clone(),
                    &mut out,
                )?;
                out.remote.push(RemoteCall::Listen(target_data));
            }
            for target_id in removed {
                // Rejected targets are already gone.
                if !st.queries_by_target.contains_key(&target_id) {
                    continue;
                }
                match self.local_store.release_target(target_id, false) {
                    Ok(()) => {
                        out.remote.push(RemoteCall::Unlisten(target_id));
                        self.remove_and_cleanup_target(st, target_id, None, &mut out);
                    }
                    Err(err) => ignore_if_primary_lease_loss(err)?,
                }
            }
        }
        self.finish(out)
    }

    fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        self.local_store.persistence().get_active_clients()
    }

    fn synchronize_with_changed_documents(&self, collection_group: Option<String>) -> FirestoreResult<()> {
        let groups = match collection_group {
            Some(group) => vec![group],
            None => self.local_store.known_collection_groups(),
        };
        let mut out = Followups::default();
        {
            let mut guard = self.state();
            let st = &mut *guard;
            for group in groups {
                let changes = self.local_store.get_new_document_changes(&group)?;
                self.emit_new_snaps_and_notify_local_store(st, changes, None, &mut out)?;
            }
        }
        self.finish(out)
    }
}

fn apply_online_state(st: &mut SyncEngineState, online_state: OnlineState, out: &mut Followups) {
    let mut snapshots = Vec::new();
    for query_view in st.query_views.values_mut() {
        if let Some(snapshot) = query_view.view.apply_online_state_change(online_state).snapshot {
            snapshots.push(snapshot);
        }
    }
    st.event_manager
        .on_online_state_change(online_state, &mut out.events);
    st.event_manager.on_watch_change(snapshots, &mut out.events);
    st.online_state = online_state;
}

fn trigger_pending_writes_callbacks(st: &mut SyncEngineState, batch_id: BatchId) {
    for sender in st
        .pending_writes_callbacks
        .remove(&batch_id)
        .unwrap_or_default()
    {
        let _ = sender.send(Ok(()));
    }
}

fn reject_pending_writes_callbacks(st: &mut SyncEngineState, message: &str) {
    for (_, senders) in std::mem::take(&mut st.pending_writes_callbacks) {
        for sender in senders {
            let _ = sender.send(Err(cancelled(message)));
        }
    }
}

fn ignore_if_primary_lease_loss(error: FirestoreError) -> FirestoreResult<()> {
    if is_primary_lease_lost(&error) {
        log::debug!("unexpectedly lost primary lease: {error}");
        Ok(())
    } else {
        Err(error)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..Default::default()
    };
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

/// Collection group whose new documents may affect `query`.
fn collection_group_of(query: &Query) -> String {
    if let Some(group) = query.collection_group_id() {
        return group.to_string();
    }
    let path = query.path();
    let index = if path.len() % 2 == 1 {
        path.len() - 1
    } else {
        path.len().saturating_sub(2)
    };
    path.segment(index).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::firestore::credentials::EmptyCredentialsProvider;
    use crate::firestore::local::shared_client_state::MemorySharedClientState;
    use crate::firestore::local::test_persistence;
    use crate::firestore::local::{BundleMetadata, BundledDocument};
    use crate::firestore::model::{DatabaseId, FieldPath, Timestamp};
    use crate::firestore::remote::{InMemoryConnection, InMemoryServer, JsonProtoSerializer, LISTEN_RPC};
    use crate::firestore::settings::{FirestoreSettings, IndexAutoCreationSettings};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::platform::runtime;
    use crate::util::AsyncQueue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
        data
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    struct Harness {
        queue: AsyncQueue,
        engine: Arc<SyncEngine>,
        remote_store: Arc<RemoteStore>,
        server: InMemoryServer,
    }

    async fn harness(settings: FirestoreSettings) -> Harness {
        let persistence = test_persistence().await;
        let local_store = LocalStore::new(persistence, User::unauthenticated(), IndexAutoCreationSettings::default());
        local_store.start().unwrap();
        let (connection, server) = InMemoryConnection::pair();
        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            connection,
            Arc::new(EmptyCredentialsProvider),
            queue.clone(),
            JsonProtoSerializer::new(DatabaseId::default("p")),
            &settings,
        );
        let engine = SyncEngine::new(
            local_store,
            Arc::clone(&remote_store),
            MemorySharedClientState::new(),
            User::unauthenticated(),
            settings.max_concurrent_limbo_resolutions,
        );
        Harness {
            queue,
            engine,
            remote_store,
            server,
        }
    }

    fn recording_observer() -> (SnapshotObserver, Arc<Mutex<Vec<ViewSnapshot>>>) {
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let observer: SnapshotObserver = Arc::new(move |snapshot: FirestoreResult<ViewSnapshot>| {
            sink.lock().unwrap().push(snapshot.unwrap());
        });
        (observer, snapshots)
    }

    #[tokio::test]
    async fn offline_listen_sees_local_writes() {
        let h = harness(FirestoreSettings::default()).await;
        let engine = Arc::clone(&h.engine);
        let remote_store = Arc::clone(&h.remote_store);
        let (observer, snapshots) = recording_observer();

        h.queue
            .enqueue(move || async move {
                engine.apply_primary_state(true)?;
                remote_store.disable_network()?;
                engine.write(vec![Mutation::set(key("rooms/a"), data(1))])?;
                engine.listen(Query::collection("rooms")?, ListenOptions::default(), observer)?;
                Ok(())
            })
            .await
            .unwrap();

        let snapshots = snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        let snapshot = &snapshots[0];
        assert!(snapshot.from_cache);
        assert!(snapshot.has_pending_writes());
        assert!(snapshot.documents.contains(&key("rooms/a")));
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_concurrency_limit() {
        let settings = FirestoreSettings {
            max_concurrent_limbo_resolutions: 1,
            ..Default::default()
        };
        let h = harness(settings).await;
        let bundle = Bundle {
            metadata: BundleMetadata {
                id: "rooms".to_string(),
                version: 1,
                create_time: version(1),
            },
            named_queries: Vec::new(),
            documents: ["rooms/a", "rooms/b"]
                .into_iter()
                .map(|path| BundledDocument {
                    document: Document::new_found(key(path), version(1), data(1)),
                    queries: Vec::new(),
                })
                .collect(),
        };

        let engine = Arc::clone(&h.engine);
        let (observer, _snapshots) = recording_observer();
        let loaded = h
            .queue
            .enqueue(move || async move {
                engine.apply_primary_state(true)?;
                let loaded = engine.load_bundle(bundle)?;
                engine.listen(Query::collection("rooms")?, ListenOptions::default(), observer)?;
                Ok(loaded)
            })
            .await
            .unwrap();
        assert_eq!(loaded.documents_loaded, 2);

        let stream = h.server.accept().await.unwrap();
        assert_eq!(stream.rpc_name, LISTEN_RPC);
        let request = stream.recv().await.unwrap();
        let target_id = request["addTarget"]["targetId"].as_i64().unwrap();

        // The backend knows neither bundled document.
        for message in [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } }),
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": "AQ==" } }),
            json!({ "targetChange": { "readTime": "1970-01-01T00:00:05Z" } }),
        ] {
            stream.send(message).unwrap();
        }

        for _ in 0..200 {
            if !h.engine.active_limbo_document_resolutions().is_empty() {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        let active = h.engine.active_limbo_document_resolutions();
        assert_eq!(active.len(), 1);
        assert_eq!(active.get(&key("rooms/a")), Some(&1));
        assert_eq!(h.engine.enqueued_limbo_document_resolutions(), vec![key("rooms/b")]);

        let limbo_request = stream.recv().await.unwrap();
        assert_eq!(limbo_request["addTarget"]["targetId"], 1);
    }

    #[tokio::test]
    async fn reloading_the_same_bundle_is_skipped() {
        let h = harness(FirestoreSettings::default()).await;
        let bundle = Bundle {
            metadata: BundleMetadata {
                id: "b".to_string(),
                version: 1,
                create_time: version(3),
            },
            named_queries: Vec::new(),
            documents: Vec::new(),
        };
        let engine = Arc::clone(&h.engine);
        let (first, second) = h
            .queue
            .enqueue(move || async move {
                let first = engine.load_bundle(bundle.clone())?;
                let second = engine.load_bundle(bundle)?;
                Ok((first, second))
            })
            .await
            .unwrap();
        assert!(!first.skipped);
        assert!(second.skipped);
    }

    #[tokio::test]
    async fn wait_for_pending_writes_without_writes_resolves() {
        let h = harness(FirestoreSettings::default()).await;
        let pending = h.engine.wait_for_pending_writes().unwrap();
        assert_eq!(pending.batch_id(), BATCH_ID_UNKNOWN);
        pending.wait().await.unwrap();
    }

    #[test]
    fn collection_group_of_document_and_collection_queries() {
        assert_eq!(collection_group_of(&Query::collection("rooms/a/messages").unwrap()), "messages");
        assert_eq!(collection_group_of(&Query::document(&key("rooms/a"))), "rooms");
        assert_eq!(collection_group_of(&Query::collection_group("chats")), "chats");
    }
}
