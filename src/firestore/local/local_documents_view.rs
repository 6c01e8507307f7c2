use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, FieldMask, IndexOffset,
    MutationKind, Overlay, OverlayedDocument, Timestamp, INITIAL_LARGEST_BATCH_ID,
};

/// Documents as the user sees them: the remote version with pending writes
/// applied through the overlay cache.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlays: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    pub fn get_document(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<Document> {
        let overlay = self.overlays.get_overlay(txn, key)?;
        let mut document = self.remote_documents.get_entry(txn, key)?;
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    pub fn get_documents<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies pending writes to `documents`. Keys in
    /// `existence_state_changed` had their remote existence flipped, which
    /// invalidates patch overlays built on the old base.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        documents: BTreeMap<DocumentKey, Document>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        Ok(self
            .compute_views_with_overlays(txn, documents, existence_state_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Like [`get_local_view_of_documents`](Self::get_local_view_of_documents)
    /// but keeps the fields each view's pending writes touched.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        documents: BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        self.compute_views_with_overlays(txn, documents, &BTreeSet::new())
    }

    fn compute_views_with_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        documents: BTreeMap<DocumentKey, Document>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlays.get_overlays(txn, documents.keys())?;
        self.compute_views(txn, documents, &overlays, existence_state_changed)
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        mut documents: BTreeMap<DocumentKey, Document>,
        overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = BTreeMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let is_patch = overlay.is_some_and(|o| matches!(o.mutation.kind, MutationKind::Patch { .. }));
            if existence_state_changed.contains(key) && (overlay.is_none() || is_patch) {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                overlay
                    .mutation
                    .apply_to_local_view(document, mask.clone(), Timestamp::now());
                mutated_fields.insert(key.clone(), mask);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let recalculated = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        for (key, document) in recalculate {
            documents.insert(key, document);
        }
        mutated_fields.extend(recalculated);

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).flatten();
                (key, OverlayedDocument::new(document, mask))
            })
            .collect())
    }

    /// Replays every pending batch touching `documents` onto them, saves the
    /// resulting overlays and returns the mutated fields per key. The
    /// documents are left holding their local views.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        documents: &mut BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys)?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(document, previous));
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        // Newest batch first, so each key is saved with the largest batch
        // that touched it.
        let mut processed = BTreeSet::new();
        for (batch_id, batch_keys) in keys_by_batch.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let mask = masks.get(&key).cloned().flatten();
                let Some(document) = documents.get(&key) else {
                    continue;
                };
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key, mutation);
                }
            }
            self.overlays.save_overlays(txn, batch_id, &overlays)?;
        }
        Ok(masks)
    }

    /// Rebuilds the overlays of `keys` from the mutation queue.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Local views of the documents matching `query` that changed after
    /// `offset`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut results = BTreeMap::new();
            if document.is_found_document() {
                results.insert(key, document);
            }
            return Ok(results);
        }
        if let Some(collection_group) = query.collection_group_id() {
            let mut results = BTreeMap::new();
            for parent in self.index_manager.get_collection_parents(txn, collection_group)? {
                if !query.path().is_prefix_of(&parent) {
                    continue;
                }
                let collection_query = query.as_collection_query_at_path(parent.child(collection_group));
                results.extend(self.get_documents_matching_collection_query(
                    txn,
                    &collection_query,
                    offset,
                    context,
                )?);
            }
            return Ok(results);
        }
        self.get_documents_matching_collection_query(txn, query, offset, context)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let overlays = self
            .overlays
            .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id)?;
        let mutated: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = self
            .remote_documents
            .get_documents_matching_query(txn, query, offset, &mutated, context)?;
        // A document may only match through its overlay.
        for key in overlays.keys() {
            documents
                .entry(key.clone())
                .or_insert_with(|| Document::new_invalid(key.clone()));
        }

        let mut results = BTreeMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }

    /// Up to about `count` local views from `collection_group` changed after
    /// `offset`, plus the largest batch id among the overlays read. Used by
    /// the index backfiller.
    pub fn get_next_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<(BatchId, BTreeMap<DocumentKey, Document>)> {
        let original = self
            .remote_documents
            .get_all_from_collection_group(txn, collection_group, offset, count)?;
        let mut overlays = if count > original.len() {
            self.overlays.get_overlays_for_collection_group(
                txn,
                collection_group,
                offset.largest_batch_id,
                count - original.len(),
            )?
        } else {
            BTreeMap::new()
        };

        let mut largest_batch_id = INITIAL_LARGEST_BATCH_ID;
        let mut documents = original.clone();
        for (key, overlay) in &overlays {
            largest_batch_id = largest_batch_id.max(overlay.largest_batch_id);
            if !original.contains_key(key) {
                documents.insert(key.clone(), self.remote_documents.get_entry(txn, key)?);
            }
        }
        let missing: Vec<DocumentKey> = original
            .keys()
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.overlays.get_overlays(txn, &missing)?);

        let views = self.compute_views(txn, documents, &overlays, &BTreeSet::new())?;
        Ok((
            largest_batch_id,
            views
                .into_iter()
                .map(|(key, overlayed)| (key, overlayed.document))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::{FieldPath, Mutation, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut value = MapValue::empty();
        for (name, number) in entries {
            value.set(&FieldPath::from_dot_separated(name).unwrap(), FirestoreValue::from_integer(*number));
        }
        value
    }

    fn view(persistence: &crate::firestore::local::persistence::Persistence) -> LocalDocumentsView {
        let serializer = persistence.serializer().clone();
        LocalDocumentsView::new(
            RemoteDocumentCache::new(serializer.clone()),
            MutationQueue::new("", serializer.clone()),
            DocumentOverlayCache::new("", serializer),
            IndexManager::new(""),
        )
    }

    #[tokio::test]
    async fn pending_batches_apply_in_batch_order() {
        let persistence = test_persistence().await;
        let documents = view(&persistence);
        let queue = MutationQueue::new("", persistence.serializer().clone());
        let key = DocumentKey::from_string("rooms/a").unwrap();

        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let mut remote = Document::new_found(
                    key.clone(),
                    SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
                    map(&[("x", 1), ("y", 1)]),
                );
                remote.set_read_time(SnapshotVersion::from_timestamp(Timestamp::new(1, 0)));
                let cache = RemoteDocumentCache::new(persistence.serializer().clone());
                let mut buffer = cache.new_change_buffer();
                buffer.add_entry(remote);
                buffer.apply(txn)?;

                let mask = FieldMask::new([FieldPath::from_dot_separated("x")?]);
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![Mutation::patch(key.clone(), map(&[("x", 2)]), mask.clone())],
                )?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![Mutation::patch(key.clone(), map(&[("x", 3)]), mask)],
                )?;
                documents.recalculate_and_save_overlays_for_document_keys(txn, &BTreeSet::from([key.clone()]))
            })
            .unwrap();

        persistence
            .run_transaction("read", TransactionMode::ReadWrite, |txn| {
                let local = documents.get_document(txn, &key)?;
                assert!(local.has_local_mutations());
                assert_eq!(local.data(), &map(&[("x", 3), ("y", 1)]));

                let query = Query::collection("rooms")?;
                let mut context = QueryContext::default();
                let results = documents.get_documents_matching_query(txn, &query, &IndexOffset::none(), &mut context)?;
                assert_eq!(results.get(&key).map(Document::data), Some(&map(&[("x", 3), ("y", 1)])));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn documents_created_locally_match_queries() {
        let persistence = test_persistence().await;
        let documents = view(&persistence);
        let queue = MutationQueue::new("", persistence.serializer().clone());
        let key = DocumentKey::from_string("rooms/a/messages/1").unwrap();

        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                queue.add_mutation_batch(txn, Timestamp::now(), Vec::new(), vec![Mutation::set(key.clone(), map(&[("n", 1)]))])?;
                documents.recalculate_and_save_overlays_for_document_keys(txn, &BTreeSet::from([key.clone()]))
            })
            .unwrap();

        persistence
            .run_transaction("read", TransactionMode::ReadWrite, |txn| {
                let mut context = QueryContext::default();
                let group = Query::collection_group("messages");
                let results = documents.get_documents_matching_query(txn, &group, &IndexOffset::none(), &mut context)?;
                assert!(results.contains_key(&key));

                let (batch_id, next) = documents.get_next_documents(txn, "messages", &IndexOffset::none(), 10)?;
                assert_eq!(batch_id, 1);
                assert!(next.get(&key).is_some_and(Document::is_found_document));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn recomputing_overlays_from_an_unchanged_queue_is_stable() {
        let persistence = test_persistence().await;
        let documents = view(&persistence);
        let queue = MutationQueue::new("", persistence.serializer().clone());
        let overlays = DocumentOverlayCache::new("", persistence.serializer().clone());
        let patched = DocumentKey::from_string("rooms/a").unwrap();
        let created = DocumentKey::from_string("rooms/b").unwrap();
        let keys = BTreeSet::from([patched.clone(), created.clone()]);

        let read_overlays = |txn: &PersistenceTransaction<'_, '_>| -> FirestoreResult<Vec<Option<Overlay>>> {
            keys.iter().map(|key| overlays.get_overlay(txn, key)).collect()
        };

        let first = persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let mask = FieldMask::new([FieldPath::from_dot_separated("x")?]);
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![
                        Mutation::patch(patched.clone(), map(&[("x", 2)]), mask),
                        Mutation::set(created.clone(), map(&[("n", 1)])),
                    ],
                )?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    Vec::new(),
                    vec![Mutation::set(created.clone(), map(&[("n", 2)]))],
                )?;
                documents.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                read_overlays(txn)
            })
            .unwrap();

        let second = persistence
            .run_transaction("recompute", TransactionMode::ReadWrite, |txn| {
                documents.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                read_overlays(txn)
            })
            .unwrap();

        assert!(first.iter().all(Option::is_some));
        assert_eq!(first, second);
        assert_eq!(second[1].as_ref().map(|overlay| overlay.largest_batch_id), Some(2));
    }
}
