use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as JsonValue;

use crate::db_key;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_key, document_path_key, DbDocumentOverlay, DOCUMENT_OVERLAYS_STORE,
    OVERLAYS_BY_BATCH_STORE, OVERLAYS_BY_COLLECTION_GROUP_STORE,
};
use crate::firestore::local::simple_db::{KeyPart, KeyRange};
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user store of the squashed pending mutation of every document,
/// indexed by collection group and by the batch that produced it.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_id: String,
    serializer: LocalSerializer,
}

impl DocumentOverlayCache {
    pub fn new(user_id: impl Into<String>, serializer: LocalSerializer) -> Self {
        Self {
            user_id: user_id.into(),
            serializer,
        }
    }

    fn overlay_key(&self, key: &DocumentKey) -> Vec<KeyPart> {
        db_key![
            self.user_id.as_str(),
            collection_key(&key.collection_path()),
            key.id()
        ]
    }

    pub fn get_overlay(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<Overlay>> {
        txn.get::<DbDocumentOverlay>(DOCUMENT_OVERLAYS_STORE, &self.overlay_key(key))?
            .map(|row| self.serializer.decode_overlay(&row))
            .transpose()
    }

    pub fn get_overlays<'k>(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut overlays = BTreeMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Stores `overlays` as produced by batch `largest_batch_id`, replacing
    /// whatever overlay the documents had before.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for mutation in overlays.values() {
            let overlay = Overlay::new(largest_batch_id, mutation.clone());
            self.save_overlay(txn, &overlay)?;
        }
        Ok(())
    }

    fn save_overlay(&self, txn: &mut PersistenceTransaction<'_, '_>, overlay: &Overlay) -> FirestoreResult<()> {
        let key = overlay.key().clone();
        self.delete_overlay(txn, &key)?;
        let path = document_path_key(&key);
        txn.put(
            DOCUMENT_OVERLAYS_STORE,
            self.overlay_key(&key),
            &self.serializer.encode_overlay(overlay),
        )?;
        txn.put(
            OVERLAYS_BY_COLLECTION_GROUP_STORE,
            db_key![
                self.user_id.as_str(),
                key.collection_group(),
                overlay.largest_batch_id,
                path.clone()
            ],
            &JsonValue::Null,
        )?;
        txn.put(
            OVERLAYS_BY_BATCH_STORE,
            db_key![self.user_id.as_str(), overlay.largest_batch_id, path],
            &JsonValue::Null,
        )
    }

    fn delete_overlay(&self, txn: &mut PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<()> {
        let Some(existing) = txn.get::<DbDocumentOverlay>(DOCUMENT_OVERLAYS_STORE, &self.overlay_key(key))? else {
            return Ok(());
        };
        let path = document_path_key(key);
        txn.delete(DOCUMENT_OVERLAYS_STORE, self.overlay_key(key))?;
        txn.delete(
            OVERLAYS_BY_COLLECTION_GROUP_STORE,
            db_key![
                self.user_id.as_str(),
                existing.collection_group,
                existing.largest_batch_id,
                path.clone()
            ],
        )?;
        txn.delete(
            OVERLAYS_BY_BATCH_STORE,
            db_key![self.user_id.as_str(), existing.largest_batch_id, path],
        )
    }

    /// Drops every overlay last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        batch_id: BatchId,
    ) -> FirestoreResult<()> {
        let range = KeyRange::prefix(db_key![self.user_id.as_str(), batch_id]);
        for row_key in txn.scan_keys(OVERLAYS_BY_BATCH_STORE, &range)? {
            if let Some(key) = key_at(&row_key, 2)? {
                self.delete_overlay(txn, &key)?;
            }
        }
        Ok(())
    }

    /// Overlays of documents directly inside `collection` that were written
    /// by batches after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let range = KeyRange::prefix(db_key![self.user_id.as_str(), collection_key(collection)]);
        let mut overlays = BTreeMap::new();
        for (_, row) in txn.scan::<DbDocumentOverlay>(DOCUMENT_OVERLAYS_STORE, &range)? {
            if row.largest_batch_id > since_batch_id {
                let overlay = self.serializer.decode_overlay(&row)?;
                overlays.insert(overlay.key().clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Up to `count` overlays of the collection group written after
    /// `since_batch_id`, in batch order. The batch that reaches `count` is
    /// always returned in full.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let range = KeyRange::prefix(db_key![self.user_id.as_str(), collection_group]);
        let mut overlays = BTreeMap::new();
        let mut current_batch: Option<BatchId> = None;
        for row_key in txn.scan_keys(OVERLAYS_BY_COLLECTION_GROUP_STORE, &range)? {
            let batch_id = match row_key.get(2) {
                Some(KeyPart::Int(id)) => *id as BatchId,
                _ => continue,
            };
            if batch_id <= since_batch_id {
                continue;
            }
            if overlays.len() >= count && current_batch != Some(batch_id) {
                break;
            }
            if let Some(key) = key_at(&row_key, 3)? {
                if let Some(overlay) = self.get_overlay(txn, &key)? {
                    overlays.insert(key, overlay);
                    current_batch = Some(batch_id);
                }
            }
        }
        Ok(overlays)
    }

    /// Keys with an overlay, for callers that track which documents still
    /// have pending writes.
    pub fn keys_for_batch(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let range = KeyRange::prefix(db_key![self.user_id.as_str(), batch_id]);
        let mut keys = BTreeSet::new();
        for row_key in txn.scan_keys(OVERLAYS_BY_BATCH_STORE, &range)? {
            if let Some(key) = key_at(&row_key, 2)? {
                keys.insert(key);
            }
        }
        Ok(keys)
    }
}

fn key_at(row_key: &[KeyPart], index: usize) -> FirestoreResult<Option<DocumentKey>> {
    match row_key.get(index) {
        Some(KeyPart::Str(path)) => Ok(Some(DocumentKey::from_path(ResourcePath::from_string(path)?)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_persistence;

    fn delete(path: &str) -> (DocumentKey, Mutation) {
        let key = DocumentKey::from_string(path).unwrap();
        (key.clone(), Mutation::delete(key))
    }

    #[tokio::test]
    async fn collection_group_reads_include_the_whole_last_batch() {
        let persistence = test_persistence().await;
        let cache = DocumentOverlayCache::new("", persistence.serializer().clone());
        persistence
            .run_transaction("save", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &BTreeMap::from([delete("rooms/a/messages/1")]))?;
                cache.save_overlays(
                    txn,
                    2,
                    &BTreeMap::from([delete("rooms/b/messages/2"), delete("rooms/b/messages/3")]),
                )?;
                cache.save_overlays(txn, 3, &BTreeMap::from([delete("rooms/c/messages/4")]))
            })
            .unwrap();

        persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                let overlays = cache.get_overlays_for_collection_group(txn, "messages", 0, 2)?;
                assert_eq!(overlays.len(), 3);
                let overlays = cache.get_overlays_for_collection_group(txn, "messages", 1, 1)?;
                assert_eq!(overlays.len(), 2);
                let collection = ResourcePath::from_string("rooms/b/messages")?;
                assert_eq!(cache.get_overlays_for_collection(txn, &collection, 0)?.len(), 2);
                assert!(cache.get_overlays_for_collection(txn, &collection, 2)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn saving_replaces_the_previous_overlay() {
        let persistence = test_persistence().await;
        let cache = DocumentOverlayCache::new("u", persistence.serializer().clone());
        persistence
            .run_transaction("save", TransactionMode::ReadWrite, |txn| {
                let (key, mutation) = delete("rooms/a");
                cache.save_overlays(txn, 1, &BTreeMap::from([(key.clone(), mutation.clone())]))?;
                cache.save_overlays(txn, 2, &BTreeMap::from([(key.clone(), mutation)]))?;
                assert!(cache.keys_for_batch(txn, 1)?.is_empty());
                assert_eq!(cache.get_overlay(txn, &key)?.map(|o| o.largest_batch_id), Some(2));
                cache.remove_overlays_for_batch_id(txn, 2)?;
                assert_eq!(cache.get_overlay(txn, &key)?, None);
                Ok(())
            })
            .unwrap();
    }
}
