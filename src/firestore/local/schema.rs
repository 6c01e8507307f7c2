//! Persisted table layout and the forward-only migration chain.
//!
//! | table | key |
//! |---|---|
//! | `owner` | `["owner"]` |
//! | `clientMetadata` | `[client_id]` |
//! | `mutationQueues` | `[user]` |
//! | `mutations` | `[user, batch_id]` |
//! | `documentMutations` | `[user, collection_path, doc_id, batch_id]` |
//! | `remoteDocuments` | `[collection_path, doc_id]` |
//! | `remoteDocumentsByReadTime` | `[collection_group, read_micros, path]` |
//! | `remoteDocumentGlobal` | `["remoteDocumentGlobal"]` |
//! | `targets` | `[target_id]` |
//! | `targetCanonicalIds` | `[canonical_id, target_id]` |
//! | `targetDocuments` | `[target_id, path]` |
//! | `documentTargets` | `[path, target_id]` |
//! | `targetGlobal` | `["targetGlobal"]` |
//! | `collectionParents` | `[collection_id, parent_path]` |
//! | `documentOverlays` | `[user, collection_path, doc_id]` |
//! | `overlaysByCollectionGroup` | `[user, collection_group, batch_id, path]` |
//! | `overlaysByBatch` | `[user, batch_id, path]` |
//! | `indexConfiguration` | `[index_id]` |
//! | `indexState` | `[index_id, user]` |
//! | `indexEntries` | `[index_id, user, array_value, directional_value, path]` |
//! | `indexEntriesByDocument` | `[index_id, user, path, array_value, directional_value]` |
//! | `bundles` | `[bundle_id]` |
//! | `namedQueries` | `[name]` |
//! | `globals` | `[name]` |
//!
//! Target 0 in `targetDocuments`/`documentTargets` is the sentinel row that
//! records the sequence number at which a document was last used.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::db_key;
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::simple_db::{KeyPart, KeyRange, SimpleDb, SimpleDbTransaction};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, ListenSequenceNumber, ResourcePath, SnapshotVersion,
    TargetId, Timestamp,
};

pub const SCHEMA_VERSION: i64 = 7;

pub const OWNER_STORE: &str = "owner";
pub const OWNER_KEY: &str = "owner";
pub const CLIENT_METADATA_STORE: &str = "clientMetadata";
pub const MUTATION_QUEUES_STORE: &str = "mutationQueues";
pub const MUTATIONS_STORE: &str = "mutations";
pub const DOCUMENT_MUTATIONS_STORE: &str = "documentMutations";
pub const REMOTE_DOCUMENTS_STORE: &str = "remoteDocuments";
pub const REMOTE_DOCUMENTS_BY_READ_TIME_STORE: &str = "remoteDocumentsByReadTime";
pub const REMOTE_DOCUMENT_GLOBAL_STORE: &str = "remoteDocumentGlobal";
pub const REMOTE_DOCUMENT_GLOBAL_KEY: &str = "remoteDocumentGlobal";
pub const TARGETS_STORE: &str = "targets";
pub const TARGET_CANONICAL_IDS_STORE: &str = "targetCanonicalIds";
pub const TARGET_DOCUMENTS_STORE: &str = "targetDocuments";
pub const DOCUMENT_TARGETS_STORE: &str = "documentTargets";
pub const TARGET_GLOBAL_STORE: &str = "targetGlobal";
pub const TARGET_GLOBAL_KEY: &str = "targetGlobal";
pub const COLLECTION_PARENTS_STORE: &str = "collectionParents";
pub const DOCUMENT_OVERLAYS_STORE: &str = "documentOverlays";
pub const OVERLAYS_BY_COLLECTION_GROUP_STORE: &str = "overlaysByCollectionGroup";
pub const OVERLAYS_BY_BATCH_STORE: &str = "overlaysByBatch";
pub const INDEX_CONFIGURATION_STORE: &str = "indexConfiguration";
pub const INDEX_STATE_STORE: &str = "indexState";
pub const INDEX_ENTRIES_STORE: &str = "indexEntries";
pub const INDEX_ENTRIES_BY_DOCUMENT_STORE: &str = "indexEntriesByDocument";
pub const BUNDLES_STORE: &str = "bundles";
pub const NAMED_QUERIES_STORE: &str = "namedQueries";
pub const GLOBALS_STORE: &str = "globals";

pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";
pub const NEXT_BATCH_ID_KEY: &str = "nextBatchId";
pub const DATA_MIGRATIONS_KEY: &str = "dataMigrations";

/// Pending data migration that needs the serializer and therefore runs in
/// the local store after open.
pub const BUILD_OVERLAYS_MIGRATION: &str = "BuildOverlays";

/// Target id used by sentinel rows.
pub const SENTINEL_TARGET_ID: TargetId = 0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbOwner {
    pub owner_id: String,
    pub allow_tab_synchronization: bool,
    pub lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbMutationQueue {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    /// Base64 write stream token.
    pub last_stream_token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbMutationBatch {
    pub user_id: String,
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<JsonValue>,
    pub mutations: Vec<JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DbRemoteDocumentKind {
    Found,
    NoDocument,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbRemoteDocument {
    pub path: ResourcePath,
    pub kind: DbRemoteDocumentKind,
    pub version: SnapshotVersion,
    pub read_time: SnapshotVersion,
    pub create_time: SnapshotVersion,
    pub has_committed_mutations: bool,
    /// Wire encoded fields for found documents.
    pub fields: Option<JsonValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbRemoteDocumentGlobal {
    pub byte_size: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbTarget {
    pub target_id: TargetId,
    pub canonical_id: String,
    pub read_time: SnapshotVersion,
    /// Base64 resume token.
    pub resume_token: String,
    pub last_listen_sequence_number: ListenSequenceNumber,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Wire encoded query target, or a documents target.
    pub query: JsonValue,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTargetDocument {
    /// Only set on sentinel rows.
    pub sequence_number: Option<ListenSequenceNumber>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbDocumentOverlay {
    pub largest_batch_id: BatchId,
    pub collection_group: String,
    pub overlay_mutation: JsonValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbIndexState {
    pub sequence_number: ListenSequenceNumber,
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: BatchId,
}

pub type DbIndexConfiguration = FieldIndex;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbBundle {
    pub bundle_id: String,
    pub create_time: Timestamp,
    pub version: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DbNamedQuery {
    pub name: String,
    pub read_time: Timestamp,
    /// Wire encoded query target plus limit type.
    pub bundled_query: JsonValue,
}

/// Collection path encoded for use as a key part.
pub fn collection_key(path: &ResourcePath) -> String {
    path.canonical_string()
}

/// Document path encoded for use as a key part.
pub fn document_path_key(key: &DocumentKey) -> String {
    key.path().canonical_string()
}

/// Opens `db`, upgrading its schema to [`SCHEMA_VERSION`] if needed.
/// Returns the version found before the upgrade.
pub fn create_or_upgrade(db: &SimpleDb) -> FirestoreResult<i64> {
    db.run_transaction("createOrUpgradeSchema", false, |txn| {
        let from: i64 = txn
            .get(GLOBALS_STORE, &db_key![SCHEMA_VERSION_KEY])?
            .unwrap_or(0);
        if from > SCHEMA_VERSION {
            return Err(failed_precondition(format!(
                "Database was written by a newer client (schema {from}, supported {SCHEMA_VERSION})"
            )));
        }
        for version in (from + 1)..=SCHEMA_VERSION {
            log::debug!("migrating schema to version {version}");
            migrate(txn, version)?;
        }
        txn.put(GLOBALS_STORE, db_key![SCHEMA_VERSION_KEY], &SCHEMA_VERSION)?;
        Ok(from)
    })
}

fn migrate(txn: &mut SimpleDbTransaction<'_>, version: i64) -> FirestoreResult<()> {
    match version {
        1 => {
            txn.put(GLOBALS_STORE, db_key![NEXT_BATCH_ID_KEY], &1)?;
        }
        2 => {
            txn.put(
                TARGET_GLOBAL_STORE,
                db_key![TARGET_GLOBAL_KEY],
                &DbTargetGlobal::default(),
            )?;
            txn.put(
                REMOTE_DOCUMENT_GLOBAL_STORE,
                db_key![REMOTE_DOCUMENT_GLOBAL_KEY],
                &DbRemoteDocumentGlobal::default(),
            )?;
        }
        3 => populate_collection_parents(txn)?,
        4 => add_data_migration(txn, BUILD_OVERLAYS_MIGRATION)?,
        5 | 6 => {}
        7 => populate_document_targets(txn)?,
        _ => {}
    }
    Ok(())
}

/// Adds every collection that holds a cached document or a pending write to
/// the collection parent index.
fn populate_collection_parents(txn: &mut SimpleDbTransaction<'_>) -> FirestoreResult<()> {
    let mut collections = BTreeSet::new();
    for (_, document) in txn.scan::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &KeyRange::all())? {
        collections.insert(document.path.parent());
    }
    for key in txn.scan_keys(DOCUMENT_MUTATIONS_STORE, &KeyRange::all())? {
        if let Some(KeyPart::Str(collection)) = key.get(1) {
            collections.insert(ResourcePath::from_string(collection)?);
        }
    }
    for collection in collections {
        if let Some(collection_id) = collection.last_segment() {
            let parent = collection.parent();
            txn.put(
                COLLECTION_PARENTS_STORE,
                db_key![collection_id, collection_key(&parent)],
                &JsonValue::Null,
            )?;
        }
    }
    Ok(())
}

fn populate_document_targets(txn: &mut SimpleDbTransaction<'_>) -> FirestoreResult<()> {
    let rows = txn.scan::<DbTargetDocument>(TARGET_DOCUMENTS_STORE, &KeyRange::all())?;
    for (key, row) in rows {
        if let [target_id, path] = key.as_slice() {
            txn.put(
                DOCUMENT_TARGETS_STORE,
                vec![path.clone(), target_id.clone()],
                &row,
            )?;
        }
    }
    Ok(())
}

pub fn add_data_migration(txn: &mut SimpleDbTransaction<'_>, name: &str) -> FirestoreResult<()> {
    let mut pending: Vec<String> = txn
        .get(GLOBALS_STORE, &db_key![DATA_MIGRATIONS_KEY])?
        .unwrap_or_default();
    if !pending.iter().any(|existing| existing == name) {
        pending.push(name.to_string());
    }
    txn.put(GLOBALS_STORE, db_key![DATA_MIGRATIONS_KEY], &pending)
}

pub fn pending_data_migrations(txn: &SimpleDbTransaction<'_>) -> FirestoreResult<Vec<String>> {
    Ok(txn
        .get(GLOBALS_STORE, &db_key![DATA_MIGRATIONS_KEY])?
        .unwrap_or_default())
}

pub fn complete_data_migration(txn: &mut SimpleDbTransaction<'_>, name: &str) -> FirestoreResult<()> {
    let mut pending = pending_data_migrations(txn)?;
    pending.retain(|existing| existing != name);
    txn.put(GLOBALS_STORE, db_key![DATA_MIGRATIONS_KEY], &pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::simple_db::MemoryStorage;

    #[test]
    fn fresh_database_runs_every_migration() {
        let db = SimpleDb::new(MemoryStorage::new());
        assert_eq!(create_or_upgrade(&db).unwrap(), 0);
        let (version, migrations, global) = db
            .run_transaction("check", true, |txn| {
                let version: Option<i64> = txn.get(GLOBALS_STORE, &db_key![SCHEMA_VERSION_KEY])?;
                let global: Option<DbTargetGlobal> =
                    txn.get(TARGET_GLOBAL_STORE, &db_key![TARGET_GLOBAL_KEY])?;
                Ok((version, pending_data_migrations(txn)?, global))
            })
            .unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION));
        assert_eq!(migrations, vec![BUILD_OVERLAYS_MIGRATION.to_string()]);
        assert_eq!(global, Some(DbTargetGlobal::default()));
        assert_eq!(create_or_upgrade(&db).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn upgrade_from_v2_indexes_existing_data() {
        let db = SimpleDb::new(MemoryStorage::new());
        db.run_transaction("seed", false, |txn| {
            txn.put(GLOBALS_STORE, db_key![SCHEMA_VERSION_KEY], &2i64)?;
            let path = ResourcePath::from_string("rooms/eros/messages/1")?;
            txn.put(
                REMOTE_DOCUMENTS_STORE,
                db_key!["rooms/eros/messages", "1"],
                &DbRemoteDocument {
                    path,
                    kind: DbRemoteDocumentKind::NoDocument,
                    version: SnapshotVersion::min(),
                    read_time: SnapshotVersion::min(),
                    create_time: SnapshotVersion::min(),
                    has_committed_mutations: false,
                    fields: None,
                },
            )?;
            txn.put(
                TARGET_DOCUMENTS_STORE,
                db_key![4, "rooms/eros/messages/1"],
                &DbTargetDocument::default(),
            )
        })
        .unwrap();

        assert_eq!(create_or_upgrade(&db).unwrap(), 2);
        let (parents, doc_targets) = db
            .run_transaction("check", true, |txn| {
                Ok((
                    txn.scan_keys(COLLECTION_PARENTS_STORE, &KeyRange::all())?,
                    txn.scan_keys(DOCUMENT_TARGETS_STORE, &KeyRange::all())?,
                ))
            })
            .unwrap();
        assert_eq!(parents, vec![db_key!["messages", "rooms/eros"]]);
        assert_eq!(doc_targets, vec![db_key!["rooms/eros/messages/1", 4]]);
    }

    #[test]
    fn refuses_newer_schema() {
        let db = SimpleDb::new(MemoryStorage::new());
        db.run_transaction("seed", false, |txn| {
            txn.put(GLOBALS_STORE, db_key![SCHEMA_VERSION_KEY], &(SCHEMA_VERSION + 1))
        })
        .unwrap();
        let err = create_or_upgrade(&db).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }
}
