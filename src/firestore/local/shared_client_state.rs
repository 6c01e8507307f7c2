//! State shared between clients that use the same persistence key.
//!
//! Clients publish their active targets, the state of their pending writes
//! and (on the primary) the online state through a [`SharedState`] port.
//! Other clients observe the changes and feed them into their sync engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};

use crate::firestore::core::OnlineState;
use crate::firestore::credentials::User;
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{BatchId, ListenSequenceNumber, TargetId};
use crate::platform::runtime::now_millis;
use crate::util::AsyncQueue;

pub const CLIENT_STATE_KEY_PREFIX: &str = "firestore_clients";
pub const MUTATION_BATCH_KEY_PREFIX: &str = "firestore_mutations";
pub const QUERY_TARGET_KEY_PREFIX: &str = "firestore_targets";
pub const ONLINE_STATE_KEY_PREFIX: &str = "firestore_online_state";
pub const SEQUENCE_NUMBER_KEY_PREFIX: &str = "firestore_sequence_number";
pub const BUNDLE_LOADED_KEY_PREFIX: &str = "firestore_bundle_loaded_v2";
pub const ZOMBIED_CLIENTS_KEY_PREFIX: &str = "firestore_zombie";

/// Receives `(key, new value)` for changes made by other subscribers.
/// Runs on the writer's thread, so it must only schedule work.
pub type SharedStateListener = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// String key/value medium visible to every client on the same machine.
pub trait SharedState: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn keys(&self, prefix: &str) -> Vec<String>;

    /// Stores `value` and notifies every subscriber except `origin`.
    fn set(&self, origin: &str, key: &str, value: String);

    fn remove(&self, origin: &str, key: &str);

    fn subscribe(&self, subscriber: &str, listener: SharedStateListener);

    fn unsubscribe(&self, subscriber: &str);
}

#[derive(Default)]
struct MemorySharedStateInner {
    values: BTreeMap<String, String>,
    listeners: BTreeMap<String, SharedStateListener>,
}

/// In-process [`SharedState`]; every client holding the same `Arc` sees the
/// same values.
#[derive(Default)]
pub struct MemorySharedState {
    inner: Mutex<MemorySharedStateInner>,
}

impl MemorySharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn inner(&self) -> MutexGuard<'_, MemorySharedStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, origin: &str, key: &str, value: Option<&str>) {
        let listeners: Vec<SharedStateListener> = self
            .inner()
            .listeners
            .iter()
            .filter(|(subscriber, _)| subscriber.as_str() != origin)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(key, value);
        }
    }
}

impl SharedState for MemorySharedState {
    fn get(&self, key: &str) -> Option<String> {
        self.inner().values.get(key).cloned()
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner()
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn set(&self, origin: &str, key: &str, value: String) {
        self.inner().values.insert(key.to_string(), value.clone());
        self.notify(origin, key, Some(&value));
    }

    fn remove(&self, origin: &str, key: &str) {
        let removed = self.inner().values.remove(key).is_some();
        if removed {
            self.notify(origin, key, None);
        }
    }

    fn subscribe(&self, subscriber: &str, listener: SharedStateListener) {
        self.inner()
            .listeners
            .insert(subscriber.to_string(), listener);
    }

    fn unsubscribe(&self, subscriber: &str) {
        self.inner().listeners.remove(subscriber);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Callbacks into the sync engine for changes made by other clients.
pub trait SharedClientStateSyncer: Send + Sync {
    fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    fn apply_active_target_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()>;

    /// Ids of the clients whose metadata rows are still fresh.
    fn get_active_clients(&self) -> FirestoreResult<Vec<String>>;

    /// Re-reads documents another client changed, e.g. by loading a bundle.
    fn synchronize_with_changed_documents(&self, collection_group: Option<String>) -> FirestoreResult<()>;
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;
pub type SequenceNumberHandler = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

/// Local half of the cross-client state.
pub trait SharedClientState: Send + Sync {
    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn add_pending_mutation(&self, batch_id: BatchId);

    /// Publishes the final state of a batch. The entry is removed right after
    /// since every observer has processed it by then.
    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<&FirestoreError>);

    /// Registers a target listened to by this client and returns the state
    /// another client may already have reached for it.
    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState;

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&FirestoreError>);

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    fn clear_query_state(&self, target_id: TargetId);

    /// Union of the active targets of every known client.
    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&self, state: OnlineState);

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber);

    fn notify_bundle_loaded(&self, collection_groups: &BTreeSet<String>);

    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>);

    fn set_online_state_handler(&self, handler: OnlineStateHandler);

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler);
}

/// Single client variant: tracks local targets only.
#[derive(Default)]
pub struct MemorySharedClientState {
    query_state: Mutex<BTreeMap<TargetId, QueryTargetState>>,
    local_targets: Mutex<BTreeSet<TargetId>>,
}

impl MemorySharedClientState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn query_state(&self) -> MutexGuard<'_, BTreeMap<TargetId, QueryTargetState>> {
        self.query_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_targets(&self) -> MutexGuard<'_, BTreeSet<TargetId>> {
        self.local_targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedClientState for MemorySharedClientState {
    fn start(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(&self, _batch_id: BatchId, _state: MutationBatchState, _error: Option<&FirestoreError>) {}

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState {
        if add_to_active_targets {
            self.local_targets().insert(target_id);
        }
        *self
            .query_state()
            .entry(target_id)
            .or_insert(QueryTargetState::NotCurrent)
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, _error: Option<&FirestoreError>) {
        self.query_state().insert(target_id, state);
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.local_targets().remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.local_targets().contains(&target_id)
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.query_state().remove(&target_id);
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.local_targets().clone()
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.local_targets().contains(&target_id)
    }

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn set_online_state(&self, _state: OnlineState) {}

    fn write_sequence_number(&self, _sequence_number: ListenSequenceNumber) {}

    fn notify_bundle_loaded(&self, _collection_groups: &BTreeSet<String>) {}

    fn set_syncer(&self, _syncer: Weak<dyn SharedClientStateSyncer>) {}

    fn set_online_state_handler(&self, _handler: OnlineStateHandler) {}

    fn set_sequence_number_handler(&self, _handler: SequenceNumberHandler) {}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ErrorRecord {
    code: String,
    message: String,
}

impl ErrorRecord {
    fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: error.code_str().to_string(),
            message: error.message().to_string(),
        }
    }

    fn into_error(self) -> FirestoreError {
        let code = FirestoreErrorCode::parse(&self.code).unwrap_or(FirestoreErrorCode::Unknown);
        FirestoreError::new(code, self.message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStateRecord {
    active_target_ids: Vec<TargetId>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationStateRecord {
    state: MutationBatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStateRecord {
    state: QueryTargetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineStateRecord {
    client_id: String,
    online_state: String,
}

/// Change observed in the shared medium, decoded from its key.
#[derive(Debug)]
enum SharedEvent {
    ClientState(String, Option<ClientStateRecord>),
    Mutation(BatchId, MutationStateRecord),
    QueryTarget(TargetId, QueryStateRecord),
    OnlineState(OnlineStateRecord),
    SequenceNumber(ListenSequenceNumber),
    BundleLoaded(Vec<String>),
}

struct MultiTabState {
    started: bool,
    user: User,
    local_targets: BTreeSet<TargetId>,
    remote_clients: BTreeMap<String, BTreeSet<TargetId>>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
    online_state_handler: Option<OnlineStateHandler>,
    sequence_number_handler: Option<SequenceNumberHandler>,
}

struct MultiTabInner {
    shared: Arc<dyn SharedState>,
    queue: AsyncQueue,
    persistence_key: String,
    client_id: String,
    state: Mutex<MultiTabState>,
}

/// Multi-client variant that publishes through a [`SharedState`].
#[derive(Clone)]
pub struct MultiTabSharedClientState {
    inner: Arc<MultiTabInner>,
}

impl MultiTabSharedClientState {
    pub fn new(
        shared: Arc<dyn SharedState>,
        queue: AsyncQueue,
        persistence_key: impl Into<String>,
        client_id: impl Into<String>,
        user: User,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MultiTabInner {
                shared,
                queue,
                persistence_key: persistence_key.into(),
                client_id: client_id.into(),
                state: Mutex::new(MultiTabState {
                    started: false,
                    user,
                    local_targets: BTreeSet::new(),
                    remote_clients: BTreeMap::new(),
                    syncer: None,
                    online_state_handler: None,
                    sequence_number_handler: None,
                }),
            }),
        })
    }
}

impl MultiTabInner {
    fn state(&self) -> MutexGuard<'_, MultiTabState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_key(&self, client_id: &str) -> String {
        format!("{CLIENT_STATE_KEY_PREFIX}_{}_{client_id}", self.persistence_key)
    }

    fn mutation_key(&self, user: &User, batch_id: BatchId) -> String {
        let mut key = format!("{MUTATION_BATCH_KEY_PREFIX}_{}_{batch_id}", self.persistence_key);
        if let Some(uid) = user.uid() {
            key.push('_');
            key.push_str(uid);
        }
        key
    }

    fn query_target_key(&self, target_id: TargetId) -> String {
        format!("{QUERY_TARGET_KEY_PREFIX}_{}_{target_id}", self.persistence_key)
    }

    fn online_state_key(&self) -> String {
        format!("{ONLINE_STATE_KEY_PREFIX}_{}", self.persistence_key)
    }

    fn sequence_number_key(&self) -> String {
        format!("{SEQUENCE_NUMBER_KEY_PREFIX}_{}", self.persistence_key)
    }

    fn bundle_loaded_key(&self) -> String {
        format!("{BUNDLE_LOADED_KEY_PREFIX}_{}", self.persistence_key)
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(encoded) => self.shared.set(&self.client_id, key, encoded),
            Err(err) => log::warn!("failed to encode shared state for {key}: {err}"),
        }
    }

    fn persist_client_state(&self) {
        let targets: Vec<TargetId> = self.state().local_targets.iter().copied().collect();
        self.set_json(
            &self.client_key(&self.client_id),
            &ClientStateRecord {
                active_target_ids: targets,
                update_time_ms: now_millis(),
            },
        );
    }

    fn persist_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<&FirestoreError>) {
        let user = self.state().user.clone();
        self.set_json(
            &self.mutation_key(&user, batch_id),
            &MutationStateRecord {
                state,
                error: error.map(ErrorRecord::from_error),
                update_time_ms: now_millis(),
            },
        );
    }

    fn remove_mutation_state(&self, batch_id: BatchId) {
        let user = self.state().user.clone();
        self.shared
            .remove(&self.client_id, &self.mutation_key(&user, batch_id));
    }

    /// Decodes a change to `key`. Keys of other persistence keys, other
    /// users or this client are ignored.
    fn parse_event(&self, key: &str, value: Option<&str>) -> Option<SharedEvent> {
        let scoped = |prefix: &str| format!("{prefix}_{}_", self.persistence_key);
        if let Some(client_id) = key.strip_prefix(&scoped(CLIENT_STATE_KEY_PREFIX)) {
            if client_id == self.client_id {
                return None;
            }
            let record = match value {
                Some(value) => Some(serde_json::from_str(value).ok()?),
                None => None,
            };
            return Some(SharedEvent::ClientState(client_id.to_string(), record));
        }
        if let Some(rest) = key.strip_prefix(&scoped(MUTATION_BATCH_KEY_PREFIX)) {
            let (batch, uid) = match rest.split_once('_') {
                Some((batch, uid)) => (batch, Some(uid)),
                None => (rest, None),
            };
            if uid != self.state().user.uid() {
                return None;
            }
            let batch_id = batch.parse().ok()?;
            let record = serde_json::from_str(value?).ok()?;
            return Some(SharedEvent::Mutation(batch_id, record));
        }
        if let Some(target) = key.strip_prefix(&scoped(QUERY_TARGET_KEY_PREFIX)) {
            let target_id = target.parse().ok()?;
            let record = serde_json::from_str(value?).ok()?;
            return Some(SharedEvent::QueryTarget(target_id, record));
        }
        if key == self.online_state_key() {
            return Some(SharedEvent::OnlineState(serde_json::from_str(value?).ok()?));
        }
        if key == self.sequence_number_key() {
            return Some(SharedEvent::SequenceNumber(value?.parse().ok()?));
        }
        if key == self.bundle_loaded_key() {
            return Some(SharedEvent::BundleLoaded(serde_json::from_str(value?).ok()?));
        }
        None
    }

    fn handle_event(&self, event: SharedEvent) -> FirestoreResult<()> {
        let (syncer, online_handler, sequence_handler) = {
            let state = self.state();
            if !state.started {
                return Ok(());
            }
            (
                state.syncer.as_ref().and_then(Weak::upgrade),
                state.online_state_handler.clone(),
                state.sequence_number_handler.clone(),
            )
        };
        match event {
            SharedEvent::ClientState(client_id, record) => {
                let (added, removed) = {
                    let mut state = self.state();
                    let existing = all_targets(&state);
                    match record {
                        Some(record) => {
                            state
                                .remote_clients
                                .insert(client_id, record.active_target_ids.into_iter().collect());
                        }
                        None => {
                            state.remote_clients.remove(&client_id);
                        }
                    }
                    let updated = all_targets(&state);
                    (
                        updated.difference(&existing).copied().collect::<Vec<_>>(),
                        existing.difference(&updated).copied().collect::<Vec<_>>(),
                    )
                };
                if added.is_empty() && removed.is_empty() {
                    return Ok(());
                }
                match syncer {
                    Some(syncer) => syncer.apply_active_target_change(added, removed),
                    None => Ok(()),
                }
            }
            SharedEvent::Mutation(batch_id, record) => match syncer {
                Some(syncer) => syncer.apply_batch_state(
                    batch_id,
                    record.state,
                    record.error.map(ErrorRecord::into_error),
                ),
                None => Ok(()),
            },
            SharedEvent::QueryTarget(target_id, record) => match syncer {
                Some(syncer) => syncer.apply_target_state(
                    target_id,
                    record.state,
                    record.error.map(ErrorRecord::into_error),
                ),
                None => Ok(()),
            },
            SharedEvent::OnlineState(record) => {
                let known = self.state().remote_clients.contains_key(&record.client_id);
                if let (true, Some(handler), Some(online_state)) =
                    (known, online_handler, OnlineState::parse(&record.online_state))
                {
                    handler(online_state);
                }
                Ok(())
            }
            SharedEvent::SequenceNumber(sequence_number) => {
                if let Some(handler) = sequence_handler {
                    handler(sequence_number);
                }
                Ok(())
            }
            SharedEvent::BundleLoaded(groups) => match syncer {
                Some(syncer) => {
                    for group in groups {
                        syncer.synchronize_with_changed_documents(Some(group))?;
                    }
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }
}

fn all_targets(state: &MultiTabState) -> BTreeSet<TargetId> {
    let mut targets = state.local_targets.clone();
    for client in state.remote_clients.values() {
        targets.extend(client.iter().copied());
    }
    targets
}

impl SharedClientState for MultiTabSharedClientState {
    fn start(&self) -> FirestoreResult<()> {
        let inner = &self.inner;
        let syncer = inner.state().syncer.as_ref().and_then(Weak::upgrade);
        let active_clients = match syncer {
            Some(syncer) => syncer.get_active_clients()?,
            None => Vec::new(),
        };
        {
            let mut state = inner.state();
            for client_id in active_clients {
                if client_id == inner.client_id {
                    continue;
                }
                let record = inner
                    .shared
                    .get(&inner.client_key(&client_id))
                    .and_then(|value| serde_json::from_str::<ClientStateRecord>(&value).ok());
                if let Some(record) = record {
                    state
                        .remote_clients
                        .insert(client_id, record.active_target_ids.into_iter().collect());
                }
            }
            state.started = true;
        }
        inner.persist_client_state();

        if let Some(record) = inner
            .shared
            .get(&inner.online_state_key())
            .and_then(|value| serde_json::from_str::<OnlineStateRecord>(&value).ok())
        {
            if let Err(err) = inner.handle_event(SharedEvent::OnlineState(record)) {
                log::debug!("ignoring stored online state: {err}");
            }
        }

        let weak = Arc::downgrade(inner);
        inner.shared.subscribe(
            &inner.client_id,
            Arc::new(move |key: &str, value: Option<&str>| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Some(event) = inner.parse_event(key, value) else {
                    return;
                };
                let queue = inner.queue.clone();
                queue.enqueue_and_forget(move || async move { inner.handle_event(event) });
            }),
        );
        log::debug!("shared client state started for client {}", inner.client_id);
        Ok(())
    }

    fn shutdown(&self) {
        let inner = &self.inner;
        let started = std::mem::replace(&mut inner.state().started, false);
        if started {
            inner.shared.unsubscribe(&inner.client_id);
            inner
                .shared
                .remove(&inner.client_id, &inner.client_key(&inner.client_id));
        }
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.inner
            .persist_mutation_state(batch_id, MutationBatchState::Pending, None);
    }

    fn update_mutation_state(&self, batch_id: BatchId, state: MutationBatchState, error: Option<&FirestoreError>) {
        self.inner.persist_mutation_state(batch_id, state, error);
        self.inner.remove_mutation_state(batch_id);
    }

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState {
        let inner = &self.inner;
        let mut query_state = QueryTargetState::NotCurrent;
        if self.is_active_query_target(target_id) {
            if let Some(record) = inner
                .shared
                .get(&inner.query_target_key(target_id))
                .and_then(|value| serde_json::from_str::<QueryStateRecord>(&value).ok())
            {
                query_state = record.state;
            }
        }
        if add_to_active_targets {
            inner.state().local_targets.insert(target_id);
            inner.persist_client_state();
        }
        query_state
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&FirestoreError>) {
        let inner = &self.inner;
        inner.set_json(
            &inner.query_target_key(target_id),
            &QueryStateRecord {
                state,
                error: error.map(ErrorRecord::from_error),
                update_time_ms: now_millis(),
            },
        );
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.inner.state().local_targets.remove(&target_id);
        self.inner.persist_client_state();
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.inner.state().local_targets.contains(&target_id)
    }

    fn clear_query_state(&self, target_id: TargetId) {
        let inner = &self.inner;
        inner
            .shared
            .remove(&inner.client_id, &inner.query_target_key(target_id));
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        all_targets(&self.inner.state())
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        all_targets(&self.inner.state()).contains(&target_id)
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        for batch_id in removed_batch_ids {
            self.inner.remove_mutation_state(*batch_id);
        }
        self.inner.state().user = user.clone();
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id);
        }
    }

    fn set_online_state(&self, state: OnlineState) {
        let inner = &self.inner;
        inner.set_json(
            &inner.online_state_key(),
            &OnlineStateRecord {
                client_id: inner.client_id.clone(),
                online_state: state.as_str().to_string(),
            },
        );
    }

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        let inner = &self.inner;
        inner.shared.set(
            &inner.client_id,
            &inner.sequence_number_key(),
            sequence_number.to_string(),
        );
    }

    fn notify_bundle_loaded(&self, collection_groups: &BTreeSet<String>) {
        let groups: Vec<&String> = collection_groups.iter().collect();
        self.inner.set_json(&self.inner.bundle_loaded_key(), &groups);
    }

    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        self.inner.state().syncer = Some(syncer);
    }

    fn set_online_state_handler(&self, handler: OnlineStateHandler) {
        self.inner.state().online_state_handler = Some(handler);
    }

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler) {
        self.inner.state().sequence_number_handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSyncer {
        batches: Mutex<Vec<(BatchId, MutationBatchState)>>,
        target_changes: Mutex<Vec<(Vec<TargetId>, Vec<TargetId>)>>,
    }

    impl SharedClientStateSyncer for RecordingSyncer {
        fn apply_batch_state(
            &self,
            batch_id: BatchId,
            state: MutationBatchState,
            _error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.batches.lock().unwrap().push((batch_id, state));
            Ok(())
        }

        fn apply_target_state(&self, _: TargetId, _: QueryTargetState, _: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }

        fn apply_active_target_change(&self, added: Vec<TargetId>, removed: Vec<TargetId>) -> FirestoreResult<()> {
            self.target_changes.lock().unwrap().push((added, removed));
            Ok(())
        }

        fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
            Ok(vec!["a".into(), "b".into()])
        }

        fn synchronize_with_changed_documents(&self, _: Option<String>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    async fn settle(queue: &AsyncQueue) {
        crate::platform::runtime::sleep(Duration::from_millis(20)).await;
        queue.drain().await.unwrap();
    }

    #[tokio::test]
    async fn mutation_states_reach_the_other_client() {
        let shared: Arc<dyn SharedState> = MemorySharedState::new();
        let user = User::new("u1");
        let queue_a = AsyncQueue::new();
        let queue_b = AsyncQueue::new();
        let a = MultiTabSharedClientState::new(Arc::clone(&shared), queue_a.clone(), "p", "a", user.clone());
        let b = MultiTabSharedClientState::new(Arc::clone(&shared), queue_b.clone(), "p", "b", user);

        let syncer_a: Arc<RecordingSyncer> = Arc::new(RecordingSyncer::default());
        let weak_a: Weak<dyn SharedClientStateSyncer> = Arc::downgrade(&syncer_a) as Weak<dyn SharedClientStateSyncer>;
        a.set_syncer(weak_a);
        a.start().unwrap();
        b.start().unwrap();

        b.add_pending_mutation(7);
        b.update_mutation_state(7, MutationBatchState::Acknowledged, None);
        settle(&queue_a).await;

        assert_eq!(
            syncer_a.batches.lock().unwrap().as_slice(),
            &[(7, MutationBatchState::Pending), (7, MutationBatchState::Acknowledged)]
        );
        assert!(shared.keys(MUTATION_BATCH_KEY_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn active_targets_are_unioned_across_clients() {
        let shared: Arc<dyn SharedState> = MemorySharedState::new();
        let queue_a = AsyncQueue::new();
        let a = MultiTabSharedClientState::new(Arc::clone(&shared), queue_a.clone(), "p", "a", User::default());
        let b = MultiTabSharedClientState::new(Arc::clone(&shared), AsyncQueue::new(), "p", "b", User::default());
        let syncer_a: Arc<RecordingSyncer> = Arc::new(RecordingSyncer::default());
        a.set_syncer(Arc::downgrade(&syncer_a) as Weak<dyn SharedClientStateSyncer>);
        a.start().unwrap();
        b.start().unwrap();

        b.add_local_query_target(4, true);
        settle(&queue_a).await;
        assert!(a.is_active_query_target(4));
        assert!(!a.is_local_query_target(4));

        b.update_query_state(4, QueryTargetState::Current, None);
        assert_eq!(a.add_local_query_target(4, true), QueryTargetState::Current);

        b.shutdown();
        settle(&queue_a).await;
        assert_eq!(
            syncer_a.target_changes.lock().unwrap().first(),
            Some(&(vec![4], vec![]))
        );
        assert!(a.is_active_query_target(4));
    }

    #[test]
    fn memory_state_tracks_local_targets() {
        let state = MemorySharedClientState::new();
        assert_eq!(state.add_local_query_target(2, true), QueryTargetState::NotCurrent);
        state.update_query_state(2, QueryTargetState::Current, None);
        assert_eq!(state.add_local_query_target(2, true), QueryTargetState::Current);
        state.remove_local_query_target(2);
        assert!(state.get_all_active_query_targets().is_empty());
    }
}
