use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::firestore::core::OnlineState;
use crate::firestore::credentials::{CredentialsProvider, User};
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, is_transient_storage_error, FirestoreError,
    FirestoreResult,
};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetId};
use crate::firestore::remote::connection::Connection;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{ListenStream, WatchStreamListener, WriteStream, WriteStreamListener};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::settings::FirestoreSettings;
use crate::util::{AsyncQueue, TimerId};

/// Delay before retrying storage access after a transient failure.
const STORAGE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Reasons the network is disabled. The network is used only while the
/// set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    IsSecondary,
    CredentialChange,
    Shutdown,
    StorageFailed,
}

struct RemoteStoreState {
    /// Targets the sync engine listens to, with their latest resume tokens.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) on the write stream, in order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state: OnlineStateTracker,
}

struct ListenMetadata<'a> {
    targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<&'a dyn RemoteSyncer>,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }
}

/// Owns the watch and write streams.
///
/// Listens are registered per target and replayed whenever the watch stream
/// reconnects. Pending mutation batches are read from the local store and
/// pipelined on the write stream up to `max_pending_writes`; each ack is
/// handed to the [`RemoteSyncer`] before the next batch is pulled in.
///
/// All methods must run on the async queue. Stream callbacks re-enter the
/// store synchronously, so no method holds the state lock while it calls a
/// stream or the syncer.
pub struct RemoteStore {
    this: Weak<RemoteStore>,
    local_store: Arc<LocalStore>,
    serializer: JsonProtoSerializer,
    queue: AsyncQueue,
    max_pending_writes: usize,
    watch_stream: Arc<ListenStream>,
    write_stream: Arc<WriteStream>,
    syncer: Mutex<Option<Weak<dyn RemoteSyncer>>>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue,
        serializer: JsonProtoSerializer,
        settings: &FirestoreSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<RemoteStore>| {
            let watch_listener: Weak<dyn WatchStreamListener> = this.clone();
            let write_listener: Weak<dyn WriteStreamListener> = this.clone();
            Self {
                this: this.clone(),
                watch_stream: ListenStream::new(
                    queue.clone(),
                    Arc::clone(&connection),
                    Arc::clone(&credentials),
                    settings.stream.clone(),
                    serializer.clone(),
                    watch_listener,
                ),
                write_stream: WriteStream::new(
                    queue.clone(),
                    connection,
                    credentials,
                    settings.stream.clone(),
                    serializer.clone(),
                    write_listener,
                ),
                local_store,
                serializer,
                queue,
                max_pending_writes: settings.max_pending_writes,
                syncer: Mutex::new(None),
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    watch_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                    online_state: OnlineStateTracker::new(settings.online_state_timeout),
                }),
            }
        })
    }

    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self.syncer.lock().unwrap_or_else(PoisonError::into_inner) = Some(syncer);
    }

    /// Connects the streams unless the network was disabled before start.
    pub fn start(&self) -> FirestoreResult<()> {
        self.enable_network_internal()
    }

    pub fn enable_network(&self) -> FirestoreResult<()> {
        self.state().offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal()
    }

    /// Stops both streams and reports `Offline` until re-enabled.
    pub fn disable_network(&self) -> FirestoreResult<()> {
        self.state().offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal()?;
        self.set_online_state(OnlineState::Offline);
        Ok(())
    }

    pub fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("remote store shutting down");
        self.state().offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal()?;
        self.set_online_state(OnlineState::Unknown);
        Ok(())
    }

    pub fn can_use_network(&self) -> bool {
        self.state().offline_causes.is_empty()
    }

    pub fn online_state(&self) -> OnlineState {
        self.state().online_state.state()
    }

    /// Number of batches sent or queued for sending.
    pub fn pending_write_count(&self) -> usize {
        self.state().write_pipeline.len()
    }

    /// Starts listening to `target_data`. Listening twice to the same target
    /// id is a no-op.
    pub fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        {
            let mut state = self.state();
            if state.listen_targets.contains_key(&target_data.target_id) {
                return Ok(());
            }
            state
                .listen_targets
                .insert(target_data.target_id, target_data.clone());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data)?;
        }
        Ok(())
    }

    pub fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let remaining = {
            let mut state = self.state();
            state.listen_targets.remove(&target_id);
            state.listen_targets.len()
        };
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id)?;
        }
        if remaining == 0 {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // No targets left, so a failed connection says nothing about
                // connectivity anymore.
                self.set_online_state(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Pulls pending batches from the local store into the write pipeline
    /// and starts the write stream when there is something to send.
    pub fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = self.state().write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match self.local_store.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch)?;
                }
                Ok(None) => {
                    if self.state().write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(err) => self.disable_network_until_recovery(err)?,
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream()?;
        }
        Ok(())
    }

    /// Restarts both streams for a new user. The syncer swaps its user
    /// state while the network is down.
    pub fn handle_credential_change(&self, user: &User) -> FirestoreResult<()> {
        self.queue.verify_operation_in_progress()?;
        log::debug!("remote store restarting streams for user {:?}", user.uid());
        self.state().offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal()?;
        self.set_online_state(OnlineState::Unknown);
        let result = match self.syncer() {
            Some(syncer) => syncer.handle_credential_change(user),
            None => Ok(()),
        };
        self.state().offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal()?;
        result
    }

    /// Only the primary client talks to the backend.
    pub fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.state().offline_causes.remove(&OfflineCause::IsSecondary);
            self.enable_network_internal()
        } else {
            self.state().offline_causes.insert(OfflineCause::IsSecondary);
            self.disable_network_internal()?;
            self.set_online_state(OnlineState::Unknown);
            Ok(())
        }
    }

    fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.set_online_state(OnlineState::Unknown);
        }
        self.fill_write_pipeline()
    }

    fn disable_network_internal(&self) -> FirestoreResult<()> {
        self.watch_stream.stop()?;
        self.write_stream.stop()?;
        let mut state = self.state();
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "dropping write pipeline with {} pending batches",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
        Ok(())
    }

    /// Takes the network down after a transient storage failure and retries
    /// storage access until it succeeds. Other errors are returned.
    fn disable_network_until_recovery(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_transient_storage_error(&error) {
            return Err(error);
        }
        log::debug!("disabling network until storage recovers: {error}");
        self.state().offline_causes.insert(OfflineCause::StorageFailed);
        self.disable_network_internal()?;
        self.set_online_state(OnlineState::Offline);
        self.schedule_storage_retry();
        Ok(())
    }

    fn schedule_storage_retry(&self) {
        let this = self.this.clone();
        self.queue
            .enqueue_after_delay(TimerId::AsyncQueueRetry, STORAGE_RETRY_DELAY, move || async move {
                let Some(store) = this.upgrade() else {
                    return Ok(());
                };
                match store.local_store.get_last_remote_snapshot_version() {
                    Ok(_) => {
                        store.state().offline_causes.remove(&OfflineCause::StorageFailed);
                        store.enable_network_internal()
                    }
                    Err(err) if is_transient_storage_error(&err) => {
                        store.schedule_storage_retry();
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            });
    }

    fn should_start_watch_stream(&self) -> bool {
        let (can_use_network, has_targets) = {
            let state = self.state();
            (state.offline_causes.is_empty(), !state.listen_targets.is_empty())
        };
        can_use_network && has_targets && !self.watch_stream.is_started()
    }

    fn start_watch_stream(&self) {
        let changed = {
            let mut state = self.state();
            state.watch_aggregator = Some(WatchChangeAggregator::new(self.serializer.clone()));
            let this = self.this.clone();
            state
                .online_state
                .handle_watch_stream_start(&self.queue, move || async move {
                    if let Some(store) = this.upgrade() {
                        let changed = store.state().online_state.handle_timeout();
                        store.broadcast_online_state(changed);
                    }
                    Ok(())
                })
        };
        self.watch_stream.start();
        self.broadcast_online_state(changed);
    }

    fn send_watch_request(&self, mut target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            let expected_count = self
                .syncer()
                .map_or(0, |syncer| syncer.get_remote_keys_for_target(target_id).len());
            target_data = target_data.with_expected_count(expected_count as i32);
        }
        if let Some(aggregator) = self.state().watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.watch(&target_data)
    }

    fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state().watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id)
    }

    fn handle_target_error(&self, change: &WatchTargetChange, error: FirestoreError) -> FirestoreResult<()> {
        for &target_id in &change.target_ids {
            let listening = self.state().listen_targets.contains_key(&target_id);
            if !listening {
                continue;
            }
            log::debug!("watch rejected target {target_id}: {error}");
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(target_id, error.clone())?;
            }
            let mut state = self.state();
            state.listen_targets.remove(&target_id);
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.remove_target(target_id);
            }
        }
        Ok(())
    }

    /// Turns the accumulated watch changes into a remote event, re-listens
    /// targets whose existence filter did not match, and hands the event to
    /// the syncer.
    fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let syncer = self.syncer();
        let (event, relistens) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenMetadata {
                targets: &state.listen_targets,
                syncer: syncer.as_deref(),
            };
            let event = aggregator.create_remote_event(&metadata, snapshot_version);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                    *target_data = target_data
                        .clone()
                        .with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut relistens = Vec::new();
            for (&target_id, &purpose) in &event.target_mismatches {
                let Some(target_data) = state.listen_targets.get_mut(&target_id) else {
                    continue;
                };
                // Drop the token so the target is re-sent in full.
                let version = target_data.snapshot_version;
                *target_data = target_data.clone().with_resume_token(Vec::new(), version);
                relistens.push(TargetData::new(
                    target_data.target.clone(),
                    target_id,
                    purpose,
                    target_data.sequence_number,
                ));
            }
            (event, relistens)
        };

        for target_data in relistens {
            self.send_unwatch_request(target_data.target_id)?;
            self.send_watch_request(target_data)?;
        }
        match syncer {
            Some(syncer) => syncer.apply_remote_event(event),
            None => Ok(()),
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state();
        state.offline_causes.is_empty() && state.write_pipeline.len() < self.max_pending_writes
    }

    fn should_start_write_stream(&self) -> bool {
        let ready = {
            let state = self.state();
            state.offline_causes.is_empty() && !state.write_pipeline.is_empty()
        };
        ready && !self.write_stream.is_started()
    }

    fn start_write_stream(&self) -> FirestoreResult<()> {
        match self.local_store.get_last_stream_token() {
            Ok(token) => self.write_stream.set_last_stream_token(token),
            Err(err) => return self.disable_network_until_recovery(err),
        }
        self.write_stream.start();
        Ok(())
    }

    fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let mutations = batch.mutations.clone();
        self.state().write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations)?;
        }
        Ok(())
    }

    fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_error(error.code) {
            return Ok(());
        }
        // The token itself may be what the backend rejects.
        log::debug!("write stream handshake failed, resetting stream token: {error}");
        self.write_stream.set_last_stream_token(Vec::new());
        if let Err(err) = self.local_store.set_last_stream_token(&[]) {
            self.disable_network_until_recovery(err)?;
        }
        Ok(())
    }

    fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.state().write_pipeline.pop_front() else {
            return Ok(());
        };
        log::debug!("backend rejected batch {}: {error}", batch.batch_id);
        // The failure is the batch's fault, not the connection's.
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.reject_failed_write(batch.batch_id, error) {
                self.disable_network_until_recovery(err)?;
            }
        }
        self.fill_write_pipeline()
    }

    fn set_online_state(&self, online_state: OnlineState) {
        let changed = self.state().online_state.set(online_state);
        self.broadcast_online_state(changed);
    }

    fn broadcast_online_state(&self, changed: Option<OnlineState>) {
        if let (Some(online_state), Some(syncer)) = (changed, self.syncer()) {
            syncer.apply_online_state_change(online_state);
        }
    }

    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn state(&self) -> MutexGuard<'_, RemoteStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WatchStreamListener for RemoteStore {
    fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = self.state().listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data)?;
        }
        Ok(())
    }

    fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        // Any message proves the backend is reachable.
        self.set_online_state(OnlineState::Online);

        if let WatchChange::Target(target_change) = &change {
            if let (WatchTargetChangeState::Removed, Some(error)) = (target_change.state, &target_change.cause) {
                return self.handle_target_error(target_change, error.clone());
            }
        }

        let syncer = self.syncer();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenMetadata {
                targets: &state.listen_targets,
                syncer: syncer.as_deref(),
            };
            match change {
                WatchChange::Document(change) => aggregator.handle_document_change(&metadata, change),
                WatchChange::Target(change) => aggregator.handle_target_change(&metadata, &change),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&metadata, &filter),
            }
        }

        if snapshot_version.is_min() {
            return Ok(());
        }
        let last_remote_version = match self.local_store.get_last_remote_snapshot_version() {
            Ok(version) => version,
            Err(err) => return self.disable_network_until_recovery(err),
        };
        // Older snapshots can arrive right after a resume; they are already
        // reflected locally.
        if snapshot_version >= last_remote_version {
            if let Err(err) = self.raise_watch_snapshot(snapshot_version) {
                self.disable_network_until_recovery(err)?;
            }
        }
        Ok(())
    }

    fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.state().watch_aggregator = None;
        if self.should_start_watch_stream() {
            let changed = self
                .state()
                .online_state
                .handle_watch_stream_failure(error.as_ref());
            self.broadcast_online_state(changed);
            self.start_watch_stream();
        } else {
            self.set_online_state(OnlineState::Unknown);
        }
        Ok(())
    }
}

impl WriteStreamListener for RemoteStore {
    fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake()
    }

    fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        if let Err(err) = self
            .local_store
            .set_last_stream_token(&self.write_stream.last_stream_token())
        {
            return self.disable_network_until_recovery(err);
        }
        let batches: Vec<MutationBatch> = self.state().write_pipeline.iter().cloned().collect();
        for batch in batches {
            self.write_stream.write_mutations(&batch.mutations)?;
        }
        Ok(())
    }

    fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>) -> FirestoreResult<()> {
        let Some(batch) = self.state().write_pipeline.pop_front() else {
            return Err(internal_error("Received a write result with an empty write pipeline"));
        };
        let result = MutationBatchResult::from(batch, commit_version, results, self.write_stream.last_stream_token())?;
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.apply_successful_write(result) {
                self.disable_network_until_recovery(err)?;
            }
        }
        self.fill_write_pipeline()
    }

    fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let Some(error) = error else {
            return Ok(());
        };
        if self.state().write_pipeline.is_empty() {
            return Ok(());
        }
        if self.write_stream.handshake_complete() {
            self.handle_write_error(error)?;
        } else {
            self.handle_handshake_error(&error)?;
        }
        if self.should_start_write_stream() {
            self.start_write_stream()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::connection::{InMemoryConnection, LISTEN_RPC};
    use crate::firestore::remote::RemoteEvent;
    use crate::firestore::credentials::EmptyCredentialsProvider;
    use crate::firestore::settings::IndexAutoCreationSettings;
    use crate::platform::runtime;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSyncer {
        events: Mutex<Vec<RemoteEvent>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        fn reject_listen(&self, _target_id: TargetId, _error: FirestoreError) -> FirestoreResult<()> {
            Ok(())
        }

        fn apply_successful_write(&self, _result: MutationBatchResult) -> FirestoreResult<()> {
            Ok(())
        }

        fn reject_failed_write(&self, _batch_id: i32, _error: FirestoreError) -> FirestoreResult<()> {
            Ok(())
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
            BTreeSet::new()
        }

        fn handle_credential_change(&self, _user: &User) -> FirestoreResult<()> {
            Ok(())
        }

        fn apply_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    #[tokio::test]
    async fn watch_snapshots_reach_the_syncer() {
        let persistence = test_persistence().await;
        let local_store = LocalStore::new(persistence, User::unauthenticated(), IndexAutoCreationSettings::default());
        local_store.start().unwrap();
        let target_data = local_store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        let target_id = target_data.target_id;

        let (connection, server) = InMemoryConnection::pair();
        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(
            local_store,
            connection,
            Arc::new(EmptyCredentialsProvider),
            queue.clone(),
            JsonProtoSerializer::new(DatabaseId::default("p")),
            &FirestoreSettings::default(),
        );
        let syncer = Arc::new(RecordingSyncer::default());
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<RecordingSyncer>;
        remote_store.set_syncer(weak);

        let store = Arc::clone(&remote_store);
        queue
            .enqueue(move || async move {
                store.start()?;
                store.listen(target_data)
            })
            .await
            .unwrap();

        let stream = server.accept().await.unwrap();
        assert_eq!(stream.rpc_name, LISTEN_RPC);
        let request = stream.recv().await.unwrap();
        assert_eq!(request["addTarget"]["targetId"], target_id);

        for message in [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } }),
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [target_id], "resumeToken": "AQ==" } }),
            json!({ "targetChange": { "readTime": "1970-01-01T00:00:05Z" } }),
        ] {
            stream.send(message).unwrap();
        }

        for _ in 0..200 {
            if !syncer.events.lock().unwrap().is_empty() {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        let events = syncer.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        let change = &events[0].target_changes[&target_id];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![1]);
        assert_eq!(syncer.online_states.lock().unwrap().last(), Some(&OnlineState::Online));
    }

    #[tokio::test]
    async fn disabling_the_network_reports_offline() {
        let persistence = test_persistence().await;
        let local_store = LocalStore::new(persistence, User::unauthenticated(), IndexAutoCreationSettings::default());
        let (connection, _server) = InMemoryConnection::pair();
        let queue = AsyncQueue::new();
        let remote_store = RemoteStore::new(
            local_store,
            connection,
            Arc::new(EmptyCredentialsProvider),
            queue.clone(),
            JsonProtoSerializer::new(DatabaseId::default("p")),
            &FirestoreSettings::default(),
        );
        let store = Arc::clone(&remote_store);
        queue
            .enqueue(move || async move { store.disable_network() })
            .await
            .unwrap();
        assert_eq!(remote_store.online_state(), OnlineState::Offline);
        assert!(!remote_store.can_use_network());
    }
}
