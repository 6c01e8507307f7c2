//! Transactions over the local database and the owner lease that decides
//! which client may run primary-only work.
//!
//! Every client sharing a persistence key writes a heartbeat row to
//! `clientMetadata`. The client holding the `owner` row (refreshed every few
//! seconds) is the primary: it runs `ReadWritePrimary` transactions, owns
//! the network streams and performs garbage collection. A lease that was not
//! refreshed within the lease timeout, or whose owner was marked zombied in
//! the shared state, may be taken over by another client.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::db_key;
use crate::firestore::core::listen_sequence::INVALID_SEQUENCE_NUMBER;
use crate::firestore::core::ListenSequence;
use crate::firestore::error::{
    failed_precondition, is_transient_storage_error, primary_lease_lost, FirestoreResult,
};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::mutation_queue::mutation_queues_contain_key;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::schema::{
    self, document_path_key, DbClientMetadata, DbOwner, DbTargetDocument, CLIENT_METADATA_STORE,
    DOCUMENT_TARGETS_STORE, OWNER_KEY, OWNER_STORE, SENTINEL_TARGET_ID, TARGET_DOCUMENTS_STORE,
};
use crate::firestore::local::shared_client_state::{SharedState, ZOMBIED_CLIENTS_KEY_PREFIX};
use crate::firestore::local::simple_db::{KeyPart, KeyRange, SimpleDb, SimpleDbTransaction, StorageBackend};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, ResourcePath, TargetId};
use crate::firestore::settings::{GarbageCollectorMode, LeaseSettings};
use crate::platform::runtime::now_millis;
use crate::util::{AsyncQueue, DelayedOperation, TimerId};

pub const PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG: &str =
    "There is another client with persistence enabled. Only one client can use \
     persistence at a time unless tab synchronization is enabled.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Requires the owner lease; fails with a lease-lost error otherwise.
    ReadWritePrimary,
}

/// Invoked with the new primary state. Must only schedule work.
pub type PrimaryStateListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Invoked after every write transaction with its sequence number.
pub type SequenceNumberSyncer = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

/// A storage transaction tagged with the listen sequence number that
/// documents touched by it are stamped with.
pub struct PersistenceTransaction<'a, 'db> {
    txn: &'a mut SimpleDbTransaction<'db>,
    current_sequence_number: ListenSequenceNumber,
    delegate: &'a ReferenceDelegate,
    orphaned_documents: BTreeSet<DocumentKey>,
}

impl<'a, 'db> PersistenceTransaction<'a, 'db> {
    pub fn new(
        txn: &'a mut SimpleDbTransaction<'db>,
        current_sequence_number: ListenSequenceNumber,
        delegate: &'a ReferenceDelegate,
    ) -> Self {
        Self {
            txn,
            current_sequence_number,
            delegate,
            orphaned_documents: BTreeSet::new(),
        }
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }

    pub fn reference_delegate(&self) -> &'a ReferenceDelegate {
        self.delegate
    }
}

impl<'db> Deref for PersistenceTransaction<'_, 'db> {
    type Target = SimpleDbTransaction<'db>;

    fn deref(&self) -> &Self::Target {
        self.txn
    }
}

impl DerefMut for PersistenceTransaction<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn
    }
}

/// Keeps track of which documents are still referenced and removes the
/// rest, either eagerly at the end of each transaction or later through
/// sequence-number based LRU collection.
pub struct ReferenceDelegate {
    mode: GarbageCollectorMode,
    serializer: LocalSerializer,
    in_memory_pins: Mutex<Option<Arc<Mutex<ReferenceSet>>>>,
}

impl ReferenceDelegate {
    pub fn new(mode: GarbageCollectorMode, serializer: LocalSerializer) -> Self {
        Self {
            mode,
            serializer,
            in_memory_pins: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> GarbageCollectorMode {
        self.mode
    }

    /// Documents referenced by live views; never collected.
    pub fn set_in_memory_pins(&self, pins: Arc<Mutex<ReferenceSet>>) {
        *self
            .in_memory_pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pins);
    }

    fn is_pinned_in_memory(&self, key: &DocumentKey) -> bool {
        let pins = self
            .in_memory_pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        pins.is_some_and(|pins| {
            pins.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(key)
        })
    }

    pub fn add_reference(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        match self.mode {
            GarbageCollectorMode::Lru => write_sentinel_key(txn, key),
            GarbageCollectorMode::Eager => {
                txn.orphaned_documents.remove(key);
                Ok(())
            }
        }
    }

    pub fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_potentially_orphaned(txn, key)
    }

    pub fn mark_potentially_orphaned(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        match self.mode {
            GarbageCollectorMode::Lru => write_sentinel_key(txn, key),
            GarbageCollectorMode::Eager => {
                txn.orphaned_documents.insert(key.clone());
                Ok(())
            }
        }
    }

    pub fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_potentially_orphaned(txn, key)
    }

    /// Called when the last listener of a target goes away.
    pub fn remove_target(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        let target_cache = TargetCache::new(self.serializer.clone());
        match self.mode {
            GarbageCollectorMode::Lru => {
                let updated = target_data
                    .clone()
                    .with_sequence_number(txn.current_sequence_number());
                target_cache.update_target_data(txn, &updated)
            }
            GarbageCollectorMode::Eager => {
                let keys = target_cache.get_matching_keys_for_target_id(txn, target_data.target_id)?;
                txn.orphaned_documents.extend(keys);
                target_cache.remove_target_data(txn, target_data)
            }
        }
    }

    /// Drops documents orphaned by the transaction when collecting eagerly.
    fn on_transaction_committed(&self, txn: &mut PersistenceTransaction<'_, '_>) -> FirestoreResult<()> {
        if self.mode != GarbageCollectorMode::Eager || txn.orphaned_documents.is_empty() {
            return Ok(());
        }
        let orphans = std::mem::take(&mut txn.orphaned_documents);
        let target_cache = TargetCache::new(self.serializer.clone());
        let documents = RemoteDocumentCache::new(self.serializer.clone());
        for key in orphans {
            let referenced = target_cache.contains_key(txn, &key)?
                || self.is_pinned_in_memory(&key)
                || mutation_queues_contain_key(txn, &key)?;
            if !referenced {
                documents.remove_document(txn, &key)?;
            }
        }
        Ok(())
    }

    fn is_pinned(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<bool> {
        if self.is_pinned_in_memory(key) {
            return Ok(true);
        }
        mutation_queues_contain_key(txn, key)
    }

    /// Documents referenced only by their sentinel row, with the sequence
    /// number at which they were last used.
    pub fn orphaned_documents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let mut orphans = Vec::new();
        let mut candidate: Option<(String, ListenSequenceNumber)> = None;
        let rows = txn.scan::<DbTargetDocument>(DOCUMENT_TARGETS_STORE, &KeyRange::all())?;
        for (key, row) in rows {
            let (Some(KeyPart::Str(path)), Some(KeyPart::Int(target_id))) = (key.first(), key.get(1)) else {
                continue;
            };
            if candidate.as_ref().is_some_and(|(current, _)| current != path) {
                if let Some((path, sequence_number)) = candidate.take() {
                    orphans.push((decode_document_key(&path)?, sequence_number));
                }
            }
            if *target_id == i64::from(SENTINEL_TARGET_ID) {
                candidate = Some((path.clone(), row.sequence_number.unwrap_or(INVALID_SEQUENCE_NUMBER)));
            } else {
                candidate = None;
            }
        }
        if let Some((path, sequence_number)) = candidate {
            orphans.push((decode_document_key(&path)?, sequence_number));
        }
        Ok(orphans)
    }

    /// Number of targets plus orphaned documents, the population LRU
    /// percentiles are computed over.
    pub fn sequence_number_count(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<usize> {
        let targets = TargetCache::new(self.serializer.clone()).get_target_count(txn)?;
        Ok(targets as usize + self.orphaned_documents(txn)?.len())
    }

    /// Removes unpinned orphaned documents last used at or before
    /// `upper_bound` and returns how many were removed.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        let documents = RemoteDocumentCache::new(self.serializer.clone());
        let mut removed = 0;
        for (key, sequence_number) in self.orphaned_documents(txn)? {
            if sequence_number > upper_bound || self.is_pinned(txn, &key)? {
                continue;
            }
            documents.remove_document(txn, &key)?;
            let path = document_path_key(&key);
            txn.delete(TARGET_DOCUMENTS_STORE, db_key![SENTINEL_TARGET_ID, path.clone()])?;
            txn.delete(DOCUMENT_TARGETS_STORE, db_key![path, SENTINEL_TARGET_ID])?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn decode_document_key(path: &str) -> FirestoreResult<DocumentKey> {
    DocumentKey::from_path(ResourcePath::from_string(path)?)
}

fn write_sentinel_key(txn: &mut PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<()> {
    let row = DbTargetDocument {
        sequence_number: Some(txn.current_sequence_number()),
    };
    let path = document_path_key(key);
    txn.put(TARGET_DOCUMENTS_STORE, db_key![SENTINEL_TARGET_ID, path.clone()], &row)?;
    txn.put(DOCUMENT_TARGETS_STORE, db_key![path, SENTINEL_TARGET_ID], &row)
}

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    pub persistence_key: String,
    pub client_id: String,
    pub synchronize_tabs: bool,
    pub force_ownership: bool,
    pub lease: LeaseSettings,
    pub garbage_collector: GarbageCollectorMode,
}

struct PersistenceState {
    started: bool,
    is_primary: bool,
    network_enabled: bool,
    in_foreground: bool,
    listen_sequence: ListenSequence,
    primary_listener: Option<PrimaryStateListener>,
    sequence_number_syncer: Option<SequenceNumberSyncer>,
    refresher: Option<DelayedOperation>,
    queue: Option<AsyncQueue>,
    last_garbage_collection_ms: i64,
}

pub struct Persistence {
    db: SimpleDb,
    serializer: LocalSerializer,
    config: PersistenceConfig,
    shared_state: Arc<dyn SharedState>,
    reference_delegate: ReferenceDelegate,
    state: Mutex<PersistenceState>,
}

impl Persistence {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        serializer: LocalSerializer,
        config: PersistenceConfig,
        shared_state: Arc<dyn SharedState>,
    ) -> Arc<Self> {
        let reference_delegate = ReferenceDelegate::new(config.garbage_collector, serializer.clone());
        Arc::new(Self {
            db: SimpleDb::new(storage),
            serializer,
            config,
            shared_state,
            reference_delegate,
            state: Mutex::new(PersistenceState {
                started: false,
                is_primary: false,
                network_enabled: true,
                in_foreground: true,
                listen_sequence: ListenSequence::new(0),
                primary_listener: None,
                sequence_number_syncer: None,
                refresher: None,
                queue: None,
                last_garbage_collection_ms: i64::MIN,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, PersistenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn serializer(&self) -> &LocalSerializer {
        &self.serializer
    }

    pub fn reference_delegate(&self) -> &ReferenceDelegate {
        &self.reference_delegate
    }

    pub fn shared_state(&self) -> &Arc<dyn SharedState> {
        &self.shared_state
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn is_primary(&self) -> bool {
        self.state().is_primary
    }

    /// Opens the database, joins the set of clients and tries to take the
    /// owner lease. Fails if another client holds an exclusive lease.
    pub fn start(self: &Arc<Self>, queue: AsyncQueue) -> FirestoreResult<()> {
        schema::create_or_upgrade(&self.db)?;
        self.state().queue = Some(queue);
        self.update_client_metadata_and_try_become_primary()?;
        if !self.is_primary() && !self.config.synchronize_tabs {
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
        }
        self.schedule_client_metadata_and_lease_refreshes();

        let highest = self.db.run_transaction("getHighestListenSequenceNumber", true, |txn| {
            let txn = PersistenceTransaction::new(txn, INVALID_SEQUENCE_NUMBER, &self.reference_delegate);
            TargetCache::new(self.serializer.clone()).get_highest_sequence_number(&txn)
        })?;
        let mut state = self.state();
        state.listen_sequence = ListenSequence::new(highest);
        state.started = true;
        log::debug!(
            "persistence started for client {} (primary: {})",
            self.config.client_id,
            state.is_primary
        );
        Ok(())
    }

    /// Registers the listener and immediately reports the current state.
    pub fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        let is_primary = {
            let mut state = self.state();
            state.primary_listener = Some(Arc::clone(&listener));
            state.is_primary
        };
        listener(is_primary);
    }

    pub fn set_sequence_number_syncer(&self, syncer: SequenceNumberSyncer) {
        self.state().sequence_number_syncer = Some(syncer);
    }

    /// Folds in a sequence number written by another client.
    pub fn observe_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        self.state().listen_sequence.observe(sequence_number);
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.state().listen_sequence.current()
    }

    pub fn set_network_enabled(self: &Arc<Self>, enabled: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.network_enabled != enabled;
            state.network_enabled = enabled;
            changed
        };
        if changed {
            self.refresh_lease_soon();
        }
    }

    /// Foreground clients are preferred as primary.
    pub fn set_in_foreground(self: &Arc<Self>, in_foreground: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.in_foreground != in_foreground;
            state.in_foreground = in_foreground;
            changed
        };
        if changed {
            self.refresh_lease_soon();
        }
    }

    fn refresh_lease_soon(self: &Arc<Self>) {
        let Some(queue) = self.state().queue.clone() else {
            return;
        };
        let persistence = Arc::clone(self);
        queue.enqueue_and_forget(move || async move {
            if persistence.is_started() {
                persistence.update_client_metadata_and_try_become_primary()?;
            }
            Ok(())
        });
    }

    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, mut body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_, '_>) -> FirestoreResult<T>,
    {
        let sequence_number = {
            let mut state = self.state();
            if mode == TransactionMode::ReadOnly {
                state.listen_sequence.current()
            } else {
                state.listen_sequence.next()
            }
        };
        let mut lease_lost = false;
        let result = self
            .db
            .run_transaction(action, mode == TransactionMode::ReadOnly, |txn| {
                if mode == TransactionMode::ReadWritePrimary && !self.holds_lease(txn)? {
                    lease_lost = true;
                    return Err(primary_lease_lost());
                }
                let mut txn = PersistenceTransaction::new(txn, sequence_number, &self.reference_delegate);
                let value = body(&mut txn)?;
                self.reference_delegate.on_transaction_committed(&mut txn)?;
                if mode == TransactionMode::ReadWritePrimary {
                    self.acquire_or_extend_lease(&mut txn)?;
                }
                Ok(value)
            });
        if lease_lost {
            log::error!("failed to obtain primary lease for action '{action}'");
            self.set_primary(false);
        }
        if result.is_ok() && mode != TransactionMode::ReadOnly {
            let syncer = self.state().sequence_number_syncer.clone();
            if let Some(syncer) = syncer {
                syncer(sequence_number);
            }
        }
        result
    }

    fn set_primary(&self, is_primary: bool) {
        let listener = {
            let mut state = self.state();
            if state.is_primary == is_primary {
                return;
            }
            state.is_primary = is_primary;
            state.primary_listener.clone()
        };
        log::debug!(
            "client {} is {} primary",
            self.config.client_id,
            if is_primary { "now" } else { "no longer" }
        );
        if let Some(listener) = listener {
            listener(is_primary);
        }
    }

    fn holds_lease(&self, txn: &SimpleDbTransaction<'_>) -> FirestoreResult<bool> {
        let owner: Option<DbOwner> = txn.get(OWNER_STORE, &db_key![OWNER_KEY])?;
        Ok(owner.is_some_and(|owner| owner.owner_id == self.config.client_id))
    }

    fn acquire_or_extend_lease(&self, txn: &mut SimpleDbTransaction<'_>) -> FirestoreResult<()> {
        txn.put(
            OWNER_STORE,
            db_key![OWNER_KEY],
            &DbOwner {
                owner_id: self.config.client_id.clone(),
                allow_tab_synchronization: self.config.synchronize_tabs,
                lease_timestamp_ms: now_millis(),
            },
        )
    }

    fn release_lease_if_held(&self, txn: &mut SimpleDbTransaction<'_>) -> FirestoreResult<()> {
        if self.holds_lease(txn)? {
            log::debug!("releasing primary lease held by {}", self.config.client_id);
            txn.delete(OWNER_STORE, db_key![OWNER_KEY])?;
        }
        Ok(())
    }

    /// Writes this client's heartbeat and takes, keeps or gives up the lease.
    pub fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        let (was_primary, network_enabled, in_foreground) = {
            let state = self.state();
            (state.is_primary, state.network_enabled, state.in_foreground)
        };
        let result = self
            .db
            .run_transaction("updateClientMetadataAndTryBecomePrimary", false, |txn| {
                txn.put(
                    CLIENT_METADATA_STORE,
                    db_key![self.config.client_id.as_str()],
                    &DbClientMetadata {
                        client_id: self.config.client_id.clone(),
                        update_time_ms: now_millis(),
                        network_enabled,
                        in_foreground,
                    },
                )?;
                let mut is_primary = was_primary;
                if is_primary && !self.holds_lease(txn)? {
                    is_primary = false;
                }
                let can_act = self.can_act_as_primary(txn, network_enabled, in_foreground)?;
                if is_primary && !can_act {
                    self.release_lease_if_held(txn)?;
                    Ok(false)
                } else if can_act {
                    self.acquire_or_extend_lease(txn)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            });
        let is_primary = match result {
            Ok(is_primary) => is_primary,
            Err(err) if is_transient_storage_error(&err) => {
                log::debug!("failed to extend owner lease: {err}");
                was_primary
            }
            Err(err) if !self.config.synchronize_tabs => return Err(err),
            Err(err) => {
                log::debug!("releasing owner lease after error: {err}");
                false
            }
        };
        self.set_primary(is_primary);
        Ok(())
    }

    fn can_act_as_primary(
        &self,
        txn: &SimpleDbTransaction<'_>,
        network_enabled: bool,
        in_foreground: bool,
    ) -> FirestoreResult<bool> {
        if self.config.force_ownership {
            return Ok(true);
        }
        let lease_timeout = self.config.lease.lease_timeout.as_millis() as i64;
        let owner: Option<DbOwner> = txn.get(OWNER_STORE, &db_key![OWNER_KEY])?;
        if let Some(owner) = owner.filter(|owner| {
            is_within_age(owner.lease_timestamp_ms, lease_timeout) && !self.is_client_zombied(&owner.owner_id)
        }) {
            let is_local = owner.owner_id == self.config.client_id;
            if is_local && network_enabled {
                return Ok(true);
            }
            if !is_local {
                if !owner.allow_tab_synchronization {
                    return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
                }
                return Ok(false);
            }
        }
        if network_enabled && in_foreground {
            return Ok(true);
        }
        let clients = self.active_clients(txn, lease_timeout)?;
        let better_client = clients.iter().any(|other| {
            if other.client_id == self.config.client_id {
                return false;
            }
            let better_network = !network_enabled && other.network_enabled;
            let better_visibility = !in_foreground && other.in_foreground;
            let same_network = network_enabled == other.network_enabled;
            better_network || (better_visibility && same_network)
        });
        Ok(!better_client)
    }

    fn active_clients(
        &self,
        txn: &SimpleDbTransaction<'_>,
        max_age_ms: i64,
    ) -> FirestoreResult<Vec<DbClientMetadata>> {
        Ok(txn
            .scan::<DbClientMetadata>(CLIENT_METADATA_STORE, &KeyRange::all())?
            .into_iter()
            .map(|(_, client)| client)
            .filter(|client| {
                is_within_age(client.update_time_ms, max_age_ms) && !self.is_client_zombied(&client.client_id)
            })
            .collect())
    }

    /// Ids of every client whose heartbeat is recent enough.
    pub fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        let max_age = self.config.lease.max_client_age.as_millis() as i64;
        self.db.run_transaction("getActiveClients", true, |txn| {
            Ok(self
                .active_clients(txn, max_age)?
                .into_iter()
                .map(|client| client.client_id)
                .collect())
        })
    }

    fn zombie_key(&self, client_id: &str) -> String {
        format!("{ZOMBIED_CLIENTS_KEY_PREFIX}_{}_{client_id}", self.config.persistence_key)
    }

    fn is_client_zombied(&self, client_id: &str) -> bool {
        self.shared_state.get(&self.zombie_key(client_id)).is_some()
    }

    fn schedule_client_metadata_and_lease_refreshes(self: &Arc<Self>) {
        let Some(queue) = self.state().queue.clone() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let refresher = queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            self.config.lease.refresh_interval,
            move || async move {
                if let Some(persistence) = weak.upgrade() {
                    persistence.update_client_metadata_and_try_become_primary()?;
                    persistence.maybe_garbage_collect_multi_client_state();
                    persistence.schedule_client_metadata_and_lease_refreshes();
                }
                Ok(())
            },
        );
        self.state().refresher = Some(refresher);
    }

    /// Removes metadata rows of clients that stopped sending heartbeats.
    fn maybe_garbage_collect_multi_client_state(&self) {
        let max_age = self.config.lease.max_client_age.as_millis() as i64;
        {
            let mut state = self.state();
            if !state.is_primary || is_within_age(state.last_garbage_collection_ms, max_age) {
                return;
            }
            state.last_garbage_collection_ms = now_millis();
        }
        let result = self.run_transaction(
            "maybeGarbageCollectMultiClientState",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let active: BTreeSet<String> = self
                    .active_clients(txn, max_age)?
                    .into_iter()
                    .map(|client| client.client_id)
                    .collect();
                let mut inactive = Vec::new();
                for (key, client) in txn.scan::<DbClientMetadata>(CLIENT_METADATA_STORE, &KeyRange::all())? {
                    if !active.contains(&client.client_id) {
                        txn.delete(CLIENT_METADATA_STORE, key)?;
                        inactive.push(client.client_id);
                    }
                }
                Ok(inactive)
            },
        );
        match result {
            Ok(inactive) => {
                for client_id in inactive {
                    log::debug!("removed inactive client {client_id}");
                    self.shared_state
                        .remove(&self.config.client_id, &self.zombie_key(&client_id));
                }
            }
            Err(err) => log::debug!("skipping client metadata cleanup: {err}"),
        }
    }

    /// Gives up the lease and removes this client's heartbeat. The client is
    /// marked zombied first so others ignore its lease right away.
    pub fn shutdown(&self) -> FirestoreResult<()> {
        let refresher = {
            let mut state = self.state();
            state.started = false;
            state.refresher.take()
        };
        if let Some(refresher) = refresher {
            refresher.cancel();
        }
        let zombie_key = self.zombie_key(&self.config.client_id);
        self.shared_state
            .set(&self.config.client_id, &zombie_key, now_millis().to_string());
        self.db.run_transaction("shutdown", false, |txn| {
            self.release_lease_if_held(txn)?;
            txn.delete(CLIENT_METADATA_STORE, db_key![self.config.client_id.as_str()])
        })?;
        self.set_primary(false);
        self.shared_state.remove(&self.config.client_id, &zombie_key);
        Ok(())
    }
}

fn is_within_age(timestamp_ms: i64, max_age_ms: i64) -> bool {
    let now = now_millis();
    if timestamp_ms > now {
        log::error!("detected an update time that is in the future: {timestamp_ms} > {now}");
        return false;
    }
    timestamp_ms >= now - max_age_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::shared_client_state::MemorySharedState;
    use crate::firestore::local::simple_db::MemoryStorage;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::JsonProtoSerializer;

    fn persistence(
        storage: &Arc<MemoryStorage>,
        shared: &Arc<MemorySharedState>,
        client_id: &str,
        synchronize_tabs: bool,
    ) -> Arc<Persistence> {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")));
        Persistence::new(
            Arc::clone(storage) as Arc<dyn StorageBackend>,
            serializer,
            PersistenceConfig {
                persistence_key: "p".into(),
                client_id: client_id.into(),
                synchronize_tabs,
                force_ownership: false,
                lease: LeaseSettings::default(),
                garbage_collector: GarbageCollectorMode::Lru,
            },
            Arc::clone(shared) as Arc<dyn SharedState>,
        )
    }

    #[tokio::test]
    async fn only_one_client_holds_the_lease() {
        let storage = MemoryStorage::new();
        let shared = MemorySharedState::new();
        let a = persistence(&storage, &shared, "a", true);
        let b = persistence(&storage, &shared, "b", true);
        a.start(AsyncQueue::new()).unwrap();
        b.start(AsyncQueue::new()).unwrap();
        assert!(a.is_primary());
        assert!(!b.is_primary());

        let err = b
            .run_transaction("primaryOnly", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert!(crate::firestore::error::is_primary_lease_lost(&err));
        a.run_transaction("primaryOnly", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap();

        a.shutdown().unwrap();
        b.update_client_metadata_and_try_become_primary().unwrap();
        assert!(b.is_primary());
        assert_eq!(b.get_active_clients().unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn exclusive_lease_rejects_second_client() {
        let storage = MemoryStorage::new();
        let shared = MemorySharedState::new();
        let a = persistence(&storage, &shared, "a", false);
        a.start(AsyncQueue::new()).unwrap();
        let b = persistence(&storage, &shared, "b", false);
        let err = b.start(AsyncQueue::new()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }

    #[tokio::test]
    async fn write_transactions_advance_the_sequence_number() {
        let storage = MemoryStorage::new();
        let shared = MemorySharedState::new();
        let a = persistence(&storage, &shared, "a", false);
        a.start(AsyncQueue::new()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        a.set_sequence_number_syncer(Arc::new(move |n| sink.lock().unwrap().push(n)));

        let first = a
            .run_transaction("write", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        let read = a
            .run_transaction("read", TransactionMode::ReadOnly, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        assert_eq!(read, first);
        a.observe_sequence_number(first + 10);
        let second = a
            .run_transaction("write", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        assert_eq!(second, first + 11);
        assert_eq!(seen.lock().unwrap().as_slice(), &[first, second]);
    }
}
