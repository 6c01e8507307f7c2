use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde_json::Value as JsonValue;

use crate::db_key;
use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::schema::{
    collection_key, document_path_key, DbRemoteDocument, DbRemoteDocumentGlobal,
    REMOTE_DOCUMENTS_BY_READ_TIME_STORE, REMOTE_DOCUMENTS_STORE, REMOTE_DOCUMENT_GLOBAL_KEY,
    REMOTE_DOCUMENT_GLOBAL_STORE,
};
use crate::firestore::local::simple_db::{KeyPart, KeyRange};
use crate::firestore::model::{Document, DocumentKey, IndexOffset, ResourcePath, SnapshotVersion};

/// Last known server state of every cached document, plus the running byte
/// size that LRU collection is triggered by.
#[derive(Clone, Debug)]
pub struct RemoteDocumentCache {
    serializer: LocalSerializer,
}

impl RemoteDocumentCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    fn document_key(key: &DocumentKey) -> Vec<KeyPart> {
        db_key![collection_key(&key.collection_path()), key.id()]
    }

    fn read_time_key(row: &DbRemoteDocument) -> FirestoreResult<Vec<KeyPart>> {
        let key = DocumentKey::from_path(row.path.clone())?;
        Ok(db_key![
            key.collection_group(),
            row.read_time.to_micros(),
            document_path_key(&key)
        ])
    }

    pub fn get_size(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        Ok(self.global(txn)?.byte_size)
    }

    fn global(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<DbRemoteDocumentGlobal> {
        Ok(txn
            .get(REMOTE_DOCUMENT_GLOBAL_STORE, &db_key![REMOTE_DOCUMENT_GLOBAL_KEY])?
            .unwrap_or_default())
    }

    fn adjust_size(&self, txn: &mut PersistenceTransaction<'_, '_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global = self.global(txn)?;
        global.byte_size = (global.byte_size + delta).max(0);
        txn.put(
            REMOTE_DOCUMENT_GLOBAL_STORE,
            db_key![REMOTE_DOCUMENT_GLOBAL_KEY],
            &global,
        )
    }

    /// Removes the row and its index entry, returning the freed size.
    fn delete_row(&self, txn: &mut PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<i64> {
        let Some(row) = txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &Self::document_key(key))? else {
            return Ok(0);
        };
        txn.delete(REMOTE_DOCUMENTS_STORE, Self::document_key(key))?;
        txn.delete(REMOTE_DOCUMENTS_BY_READ_TIME_STORE, Self::read_time_key(&row)?)?;
        Ok(self.serializer.document_size(&row))
    }

    fn write_document(&self, txn: &mut PersistenceTransaction<'_, '_>, document: &Document) -> FirestoreResult<()> {
        let freed = self.delete_row(txn, document.key())?;
        let row = self.serializer.encode_remote_document(document);
        let size = self.serializer.document_size(&row);
        txn.put(
            REMOTE_DOCUMENTS_BY_READ_TIME_STORE,
            Self::read_time_key(&row)?,
            &JsonValue::Null,
        )?;
        txn.put(REMOTE_DOCUMENTS_STORE, Self::document_key(document.key()), &row)?;
        add_to_collection_parent_index(txn, &document.key().collection_path())?;
        self.adjust_size(txn, size - freed)
    }

    pub fn remove_document(&self, txn: &mut PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<()> {
        let freed = self.delete_row(txn, key)?;
        self.adjust_size(txn, -freed)
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<Document> {
        match txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &Self::document_key(key))? {
            Some(row) => self.serializer.decode_remote_document(&row),
            None => Ok(Document::new_invalid(key.clone())),
        }
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        keys.into_iter()
            .map(|key| Ok((key.clone(), self.get_entry(txn, key)?)))
            .collect()
    }

    /// Documents directly in the query's collection changed after `offset`
    /// that either match the query or have pending writes.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let range = KeyRange::prefix(db_key![collection_key(query.path())]);
        let mut results = BTreeMap::new();
        for (_, row) in txn.scan::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &range)? {
            context.documents_read_count += 1;
            let document = self.serializer.decode_remote_document(&row)?;
            if IndexOffset::from_document(&document) <= *offset {
                continue;
            }
            let mutated = mutated_keys.contains(document.key());
            if mutated || (document.is_found_document() && query.matches(&document)) {
                results.insert(document.key().clone(), document);
            }
        }
        Ok(results)
    }

    /// Up to `limit` documents of a collection group read after `offset`,
    /// in read time order. Used by the index backfiller.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let lower = db_key![
            collection_group,
            offset.read_time.to_micros(),
            document_path_key(&offset.document_key)
        ];
        let range = KeyRange::prefix(db_key![collection_group])
            .with_bounds(Bound::Excluded(lower), Bound::Unbounded);
        let mut results = BTreeMap::new();
        for row_key in txn.scan_keys(REMOTE_DOCUMENTS_BY_READ_TIME_STORE, &range)? {
            if results.len() >= limit {
                break;
            }
            if let Some(KeyPart::Str(path)) = row_key.get(2) {
                let key = DocumentKey::from_path(ResourcePath::from_string(path)?)?;
                let document = self.get_entry(txn, &key)?;
                results.insert(key, document);
            }
        }
        Ok(results)
    }

    pub fn new_change_buffer(&self) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer {
            cache: self.clone(),
            changes: BTreeMap::new(),
        }
    }
}

/// Collects document writes so they can be applied in one go, tracking
/// the size delta of the whole set.
#[derive(Debug)]
pub struct RemoteDocumentChangeBuffer {
    cache: RemoteDocumentCache,
    changes: BTreeMap<DocumentKey, Document>,
}

impl RemoteDocumentChangeBuffer {
    /// Buffers `document`, which must carry its read time.
    pub fn add_entry(&mut self, document: Document) {
        self.changes.insert(document.key().clone(), document);
    }

    pub fn remove_entry(&mut self, key: DocumentKey, read_time: SnapshotVersion) {
        let mut document = Document::new_invalid(key.clone());
        document.set_read_time(read_time);
        self.changes.insert(key, document);
    }

    /// The buffered document, falling back to the cache.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<Document> {
        match self.changes.get(key) {
            Some(document) => Ok(document.clone()),
            None => self.cache.get_entry(txn, key),
        }
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        keys.into_iter()
            .map(|key| Ok((key.clone(), self.get_entry(txn, key)?)))
            .collect()
    }

    pub fn apply(self, txn: &mut PersistenceTransaction<'_, '_>) -> FirestoreResult<()> {
        for (key, document) in &self.changes {
            if document.is_valid_document() {
                self.cache.write_document(txn, document)?;
            } else {
                self.cache.remove_document(txn, key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::{FieldPath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    fn found(path: &str, read_seconds: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(read_seconds));
        let mut document = Document::new_found(DocumentKey::from_string(path).unwrap(), version(1), data);
        document.set_read_time(version(read_seconds));
        document
    }

    #[tokio::test]
    async fn tracks_size_and_read_time_order() {
        let persistence = test_persistence().await;
        let cache = RemoteDocumentCache::new(persistence.serializer().clone());
        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let mut buffer = cache.new_change_buffer();
                buffer.add_entry(found("rooms/b", 2));
                buffer.add_entry(found("rooms/a", 3));
                buffer.add_entry(found("users/a/rooms/c", 1));
                buffer.add_entry(found("people/x", 1));
                buffer.apply(txn)
            })
            .unwrap();

        persistence
            .run_transaction("read", TransactionMode::ReadWrite, |txn| {
                let size = cache.get_size(txn)?;
                assert!(size > 0);

                let group = cache.get_all_from_collection_group(txn, "rooms", &IndexOffset::none(), 2)?;
                let keys: Vec<_> = group.keys().map(|k| k.to_string()).collect();
                assert_eq!(keys, vec!["rooms/b", "users/a/rooms/c"]);

                let offset = IndexOffset::new(version(2), DocumentKey::from_string("rooms/b")?, -1);
                let query = Query::collection("rooms")?;
                let changed = cache.get_documents_matching_query(txn, &query, &offset, &BTreeSet::new(), &mut QueryContext::default())?;
                assert_eq!(changed.len(), 1);

                let key = DocumentKey::from_string("rooms/a")?;
                cache.remove_document(txn, &key)?;
                assert!(!cache.get_entry(txn, &key)?.is_valid_document());
                assert!(cache.get_size(txn)? < size);
                Ok(())
            })
            .unwrap();
    }
}
