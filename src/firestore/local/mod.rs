//! Durable client cache: the key-value storage layer, its schema, and the
//! caches and services built on top of it.

pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod index_backfiller;
pub mod index_encoding;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_serializer;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod schema;
pub mod shared_client_state;
pub mod simple_db;
pub mod target_cache;
pub mod target_data;
pub mod target_index_matcher;

#[doc(inline)]
pub use bundle_cache::{Bundle, BundleMetadata, BundledDocument, NamedQuery};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, UserChangeResult};
#[doc(inline)]
pub use persistence::{Persistence, PersistenceConfig, PersistenceTransaction, TransactionMode};
#[doc(inline)]
pub use simple_db::{FileStorage, KeyPart, KeyRange, MemoryStorage, StorageBackend};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};

#[cfg(test)]
pub(crate) async fn test_persistence() -> std::sync::Arc<Persistence> {
    use std::sync::Arc;

    use crate::firestore::local::local_serializer::LocalSerializer;
    use crate::firestore::local::shared_client_state::{MemorySharedState, SharedState};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::JsonProtoSerializer;
    use crate::firestore::settings::{GarbageCollectorMode, LeaseSettings};
    use crate::util::AsyncQueue;

    let persistence = Persistence::new(
        MemoryStorage::new() as Arc<dyn StorageBackend>,
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        PersistenceConfig {
            persistence_key: "p".into(),
            client_id: "test-client".into(),
            synchronize_tabs: false,
            force_ownership: false,
            lease: LeaseSettings::default(),
            garbage_collector: GarbageCollectorMode::Lru,
        },
        MemorySharedState::new() as Arc<dyn SharedState>,
    );
    if let Err(err) = persistence.start(AsyncQueue::new()) {
        panic!("failed to start test persistence: {err}");
    }
    persistence
}
