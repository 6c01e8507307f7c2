//! The client facade: builds every component from a [`ClientContext`] and
//! routes each public operation through the client's [`AsyncQueue`].

use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::channel::oneshot;

use crate::firestore::core::event_manager::{ListenOptions, SnapshotObserver, SnapshotsInSyncObserver};
use crate::firestore::core::sync_engine::{LoadBundleResult, PendingWrite, SyncEngine};
use crate::firestore::core::{OnlineState, Query, View, ViewSnapshot};
use crate::firestore::credentials::{CredentialsProvider, User};
use crate::firestore::error::{unavailable, FirestoreResult};
use crate::firestore::local::index_backfiller::{IndexBackfiller, IndexBackfillerScheduler};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults, LruScheduler};
use crate::firestore::local::shared_client_state::{
    MemorySharedClientState, MultiTabSharedClientState, SharedClientState, SharedState,
};
use crate::firestore::local::{
    Bundle, LocalStore, NamedQuery, Persistence, PersistenceConfig, StorageBackend,
};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, FieldIndex, Mutation};
use crate::firestore::remote::{Connection, JsonProtoSerializer, RemoteStore};
use crate::firestore::settings::FirestoreSettings;
use crate::util::AsyncQueue;

/// Everything a client instance is built from. Passed once to
/// [`FirestoreClient::start`]; no component reads process-wide state.
#[derive(Clone)]
pub struct ClientContext {
    pub database_id: DatabaseId,
    /// Namespaces storage and shared state between clients of one database.
    pub persistence_key: String,
    pub client_id: String,
    pub settings: FirestoreSettings,
    pub storage: Arc<dyn StorageBackend>,
    /// Medium shared with other clients of the same persistence key.
    pub shared_state: Arc<dyn SharedState>,
    pub connection: Arc<dyn Connection>,
    pub credentials: Arc<dyn CredentialsProvider>,
}

struct ClientComponents {
    persistence: Arc<Persistence>,
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    sync_engine: Arc<SyncEngine>,
    garbage_collector: Arc<LruGarbageCollector>,
    lru_scheduler: Arc<LruScheduler>,
    backfill_scheduler: Arc<IndexBackfillerScheduler>,
    credentials: Arc<dyn CredentialsProvider>,
}

impl ClientComponents {
    /// Applies a lease change and runs the background jobs only on the
    /// primary.
    fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        self.sync_engine.apply_primary_state(is_primary)?;
        if is_primary {
            if !self.lru_scheduler.started() {
                self.lru_scheduler.start(Arc::downgrade(&self.local_store));
            }
            if !self.backfill_scheduler.started() {
                self.backfill_scheduler
                    .start(Arc::downgrade(&self.local_store));
            }
        } else {
            self.lru_scheduler.stop();
            self.backfill_scheduler.stop();
        }
        Ok(())
    }
}

/// A running client. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue,
    components: Arc<ClientComponents>,
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    client: FirestoreClient,
    query: Query,
    listener_id: u64,
}

impl ListenerRegistration {
    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Stops the listener. Resolves once its target was released.
    pub async fn remove(self) -> FirestoreResult<()> {
        self.client.unlisten(self.query, self.listener_id).await
    }
}

impl FirestoreClient {
    /// Opens persistence, wires every component and connects to the
    /// backend if this client becomes primary.
    pub async fn start(context: ClientContext) -> FirestoreResult<Self> {
        context.settings.validate()?;
        let queue = AsyncQueue::new();
        let build_queue = queue.clone();
        let components = queue
            .enqueue(move || async move { build_components(context, build_queue) })
            .await?;
        Ok(Self { queue, components })
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn is_primary(&self) -> bool {
        self.components.sync_engine.is_primary_client()
    }

    pub fn online_state(&self) -> OnlineState {
        self.components.sync_engine.online_state()
    }

    pub fn current_user(&self) -> User {
        self.components.sync_engine.current_user()
    }

    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        let components = Arc::clone(&self.components);
        let listened = query.clone();
        let listener_id = self
            .queue
            .enqueue(move || async move { components.sync_engine.listen(listened, options, observer) })
            .await?;
        Ok(ListenerRegistration {
            client: self.clone(),
            query,
            listener_id,
        })
    }

    async fn unlisten(&self, query: Query, listener_id: u64) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.sync_engine.unlisten(&query, listener_id) })
            .await
    }

    pub async fn add_snapshots_in_sync_listener(&self, observer: SnapshotsInSyncObserver) -> FirestoreResult<u64> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { Ok(components.sync_engine.add_snapshots_in_sync_listener(observer)) })
            .await
    }

    pub async fn remove_snapshots_in_sync_listener(&self, id: u64) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move {
                components.sync_engine.remove_snapshots_in_sync_listener(id);
                Ok(())
            })
            .await
    }

    /// Applies `mutations` locally. Await [`PendingWrite::wait`] on the
    /// result for the backend's verdict.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.sync_engine.write(mutations) })
            .await
    }

    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        let pending = self
            .queue
            .enqueue(move || async move { components.sync_engine.wait_for_pending_writes() })
            .await?;
        pending.wait().await
    }

    /// The cached document merged with pending writes.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Document> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.local_store.read_document(&key) })
            .await
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move {
                let result = components.local_store.execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys);
                let changes = view.compute_doc_changes(&result.documents, None);
                let view_change = view.apply_changes(changes, false, None, false);
                Ok(view_change
                    .snapshot
                    .unwrap_or_else(|| view.compute_initial_snapshot()))
            })
            .await
    }

    /// Waits for a snapshot the backend confirmed. Fails with
    /// `Unavailable` while offline instead of falling back to the cache.
    pub async fn get_documents_from_server(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let observer: SnapshotObserver = Arc::new(move |result: FirestoreResult<ViewSnapshot>| {
            if let Some(sender) = sender.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = sender.send(result);
            }
        });
        let options = ListenOptions {
            include_metadata_changes: true,
            wait_for_sync_when_online: true,
        };

        let components = Arc::clone(&self.components);
        let listened = query.clone();
        let listener_id = self
            .queue
            .enqueue(move || async move {
                if !components.remote_store.can_use_network()
                    || components.sync_engine.online_state() == OnlineState::Offline
                {
                    return Err(unavailable("Failed to get documents from server because the client is offline."));
                }
                components.sync_engine.listen(listened, options, observer)
            })
            .await?;

        let result = match receiver.await {
            Ok(result) => result,
            Err(_) => Err(unavailable("The listen was stopped before a snapshot arrived")),
        };
        self.unlisten(query, listener_id).await?;
        let snapshot = result?;
        if snapshot.from_cache {
            return Err(unavailable(
                "Failed to get documents from server. (However, these documents may exist in the local cache.)",
            ));
        }
        Ok(snapshot)
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move {
                components.persistence.set_network_enabled(true);
                components.remote_store.enable_network()
            })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move {
                components.persistence.set_network_enabled(false);
                components.remote_store.disable_network()
            })
            .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.local_store.configure_field_indexes(indexes) })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move {
                components.local_store.set_index_auto_creation_enabled(enabled);
                Ok(())
            })
            .await
    }

    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.local_store.delete_all_field_indexes() })
            .await
    }

    pub async fn load_bundle(&self, bundle: Bundle) -> FirestoreResult<LoadBundleResult> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.sync_engine.load_bundle(bundle) })
            .await
    }

    pub async fn get_named_query(&self, name: String) -> FirestoreResult<Option<NamedQuery>> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move { components.local_store.get_named_query(&name) })
            .await
    }

    /// Runs one LRU collection now instead of waiting for the scheduler.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let components = Arc::clone(&self.components);
        self.queue
            .enqueue(move || async move {
                components
                    .local_store
                    .collect_garbage(&components.garbage_collector)
            })
            .await
    }

    /// Stops the streams and schedulers, releases the lease and rejects any
    /// further operation.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        let components = Arc::clone(&self.components);
        self.queue
            .shutdown(move || async move {
                log::debug!("shutting down client {}", components.persistence.client_id());
                components.credentials.remove_change_listener();
                components.lru_scheduler.stop();
                components.backfill_scheduler.stop();
                components.remote_store.shutdown()?;
                components.sync_engine.shutdown();
                components.shared_client_state.shutdown();
                components.persistence.shutdown()
            })
            .await
    }
}

fn build_components(context: ClientContext, queue: AsyncQueue) -> FirestoreResult<Arc<ClientComponents>> {
    let ClientContext {
        database_id,
        persistence_key,
        client_id,
        settings,
        storage,
        shared_state,
        connection,
        credentials,
    } = context;

    let serializer = JsonProtoSerializer::new(database_id);
    let local_serializer = LocalSerializer::new(serializer.clone());
    let persistence = Persistence::new(
        storage,
        local_serializer.clone(),
        PersistenceConfig {
            persistence_key: persistence_key.clone(),
            client_id: client_id.clone(),
            synchronize_tabs: settings.synchronize_tabs,
            force_ownership: settings.force_ownership,
            lease: settings.lease.clone(),
            garbage_collector: settings.garbage_collector,
        },
        Arc::clone(&shared_state),
    );
    persistence.start(queue.clone())?;

    // The listener fires for later changes only; the initial user is
    // returned.
    let credential_queue = queue.clone();
    let remote_store_slot: Arc<Mutex<Weak<RemoteStore>>> = Arc::new(Mutex::new(Weak::new()));
    let listener_slot = Arc::clone(&remote_store_slot);
    let initial_user = credentials.set_change_listener(Arc::new(move |user: User| {
        let remote_store = listener_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        credential_queue.enqueue_and_forget(move || async move {
            match remote_store.upgrade() {
                Some(remote_store) => remote_store.handle_credential_change(&user),
                None => Ok(()),
            }
        });
    }));

    let local_store = LocalStore::new(
        Arc::clone(&persistence),
        initial_user.clone(),
        settings.index_auto_creation.clone(),
    );
    local_store.start()?;

    let remote_store = RemoteStore::new(
        Arc::clone(&local_store),
        connection,
        Arc::clone(&credentials),
        queue.clone(),
        serializer,
        &settings,
    );
    *remote_store_slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&remote_store);

    let shared_client_state: Arc<dyn SharedClientState> = if settings.synchronize_tabs {
        MultiTabSharedClientState::new(
            shared_state,
            queue.clone(),
            persistence_key,
            client_id,
            initial_user.clone(),
        )
    } else {
        MemorySharedClientState::new()
    };

    let sync_engine = SyncEngine::new(
        Arc::clone(&local_store),
        Arc::clone(&remote_store),
        Arc::clone(&shared_client_state),
        initial_user,
        settings.max_concurrent_limbo_resolutions,
    );

    let garbage_collector = Arc::new(LruGarbageCollector::new(
        settings.cache_size_bytes,
        settings.lru.clone(),
        local_serializer,
    ));
    let components = Arc::new(ClientComponents {
        lru_scheduler: LruScheduler::new(Arc::clone(&garbage_collector), queue.clone()),
        backfill_scheduler: IndexBackfillerScheduler::new(
            IndexBackfiller::new(settings.backfill.clone()),
            queue.clone(),
        ),
        garbage_collector,
        persistence: Arc::clone(&persistence),
        local_store,
        remote_store: Arc::clone(&remote_store),
        shared_client_state: Arc::clone(&shared_client_state),
        sync_engine: Arc::clone(&sync_engine),
        credentials,
    });

    let online_queue = queue.clone();
    let online_engine = Arc::downgrade(&sync_engine);
    shared_client_state.set_online_state_handler(Arc::new(move |online_state: OnlineState| {
        let engine = online_engine.clone();
        online_queue.enqueue_and_forget(move || async move {
            if let Some(engine) = engine.upgrade() {
                engine.apply_shared_online_state(online_state);
            }
            Ok(())
        });
    }));
    let observed = Arc::downgrade(&persistence);
    shared_client_state.set_sequence_number_handler(Arc::new(move |sequence_number: i64| {
        if let Some(persistence) = observed.upgrade() {
            persistence.observe_sequence_number(sequence_number);
        }
    }));
    let publisher = Arc::downgrade(&shared_client_state);
    persistence.set_sequence_number_syncer(Arc::new(move |sequence_number: i64| {
        if let Some(shared) = publisher.upgrade() {
            shared.write_sequence_number(sequence_number);
        }
    }));

    components.apply_primary_state(persistence.is_primary())?;
    shared_client_state.start()?;
    remote_store.start()?;

    let primary_queue = queue;
    let primary_components = Arc::downgrade(&components);
    persistence.set_primary_state_listener(Arc::new(move |is_primary: bool| {
        let components = primary_components.clone();
        primary_queue.enqueue_and_forget(move || async move {
            match components.upgrade() {
                Some(components) => components.apply_primary_state(is_primary),
                None => Ok(()),
            }
        });
    }));
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::credentials::EmptyCredentialsProvider;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::local::shared_client_state::MemorySharedState;
    use crate::firestore::local::MemoryStorage;
    use crate::firestore::remote::InMemoryConnection;

    fn context(connection: Arc<dyn Connection>) -> ClientContext {
        ClientContext {
            database_id: DatabaseId::default("p"),
            persistence_key: "p".into(),
            client_id: "client-a".into(),
            settings: FirestoreSettings::default(),
            storage: MemoryStorage::new(),
            shared_state: MemorySharedState::new(),
            connection,
            credentials: Arc::new(EmptyCredentialsProvider),
        }
    }

    #[tokio::test]
    async fn single_client_becomes_primary() {
        let (connection, _server) = InMemoryConnection::pair();
        let client = FirestoreClient::start(context(connection)).await.unwrap();
        assert!(client.is_primary());
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn server_reads_fail_while_the_network_is_disabled() {
        let (connection, _server) = InMemoryConnection::pair();
        let client = FirestoreClient::start(context(connection)).await.unwrap();
        client.disable_network().await.unwrap();

        let err = client
            .get_documents_from_server(Query::collection("rooms").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_rejected() {
        let (connection, _server) = InMemoryConnection::pair();
        let client = FirestoreClient::start(context(connection)).await.unwrap();
        client.shutdown().await.unwrap();
        assert!(client
            .get_documents_from_local_cache(Query::collection("rooms").unwrap())
            .await
            .is_err());
    }
}
