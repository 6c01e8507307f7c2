use std::collections::BTreeSet;
use std::ops::Bound;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value as JsonValue;

use crate::db_key;
use crate::firestore::core::Query;
use crate::firestore::error::{data_loss, internal_error, FirestoreResult};
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_key, DbMutationBatch, DbMutationQueue, DOCUMENT_MUTATIONS_STORE, GLOBALS_STORE,
    MUTATIONS_STORE, MUTATION_QUEUES_STORE, NEXT_BATCH_ID_KEY,
};
use crate::firestore::local::simple_db::{KeyPart, KeyRange};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};

/// Durable FIFO of the write batches one user has not had acknowledged.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_id: String,
    serializer: LocalSerializer,
}

impl MutationQueue {
    pub fn new(user_id: impl Into<String>, serializer: LocalSerializer) -> Self {
        Self {
            user_id: user_id.into(),
            serializer,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<DbMutationQueue> {
        Ok(txn
            .get(MUTATION_QUEUES_STORE, &db_key![self.user_id.as_str()])?
            .unwrap_or_else(|| DbMutationQueue {
                user_id: self.user_id.clone(),
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: String::new(),
            }))
    }

    fn user_range(&self) -> KeyRange {
        KeyRange::prefix(db_key![self.user_id.as_str()])
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<bool> {
        Ok(txn.count(MUTATIONS_STORE, &self.user_range())? == 0)
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let batch_id: BatchId = txn
            .get(GLOBALS_STORE, &db_key![NEXT_BATCH_ID_KEY])?
            .unwrap_or(1);
        txn.put(GLOBALS_STORE, db_key![NEXT_BATCH_ID_KEY], &(batch_id + 1))?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let row = self.serializer.encode_mutation_batch(&self.user_id, &batch);
        txn.put(MUTATIONS_STORE, db_key![self.user_id.as_str(), batch_id], &row)?;

        let metadata = self.metadata(txn)?;
        txn.put(MUTATION_QUEUES_STORE, db_key![self.user_id.as_str()], &metadata)?;

        for mutation in &batch.mutations {
            let key = &mutation.key;
            txn.put(
                DOCUMENT_MUTATIONS_STORE,
                document_mutation_key(&self.user_id, key, batch_id),
                &JsonValue::Null,
            )?;
            add_to_collection_parent_index(txn, &key.collection_path())?;
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get::<DbMutationBatch>(MUTATIONS_STORE, &db_key![self.user_id.as_str(), batch_id])?
            .map(|row| self.serializer.decode_mutation_batch(&row))
            .transpose()
    }

    /// First batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let range = self.user_range().with_bounds(
            Bound::Excluded(db_key![self.user_id.as_str(), batch_id]),
            Bound::Unbounded,
        );
        txn.scan::<DbMutationBatch>(MUTATIONS_STORE, &range)?
            .into_iter()
            .next()
            .map(|(_, row)| self.serializer.decode_mutation_batch(&row))
            .transpose()
    }

    pub fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<BatchId> {
        Ok(txn
            .scan_keys(MUTATIONS_STORE, &self.user_range())?
            .last()
            .and_then(|key| batch_id_at(key, 1))
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn get_all_mutation_batches(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        txn.scan::<DbMutationBatch>(MUTATIONS_STORE, &self.user_range())?
            .into_iter()
            .map(|(_, row)| self.serializer.decode_mutation_batch(&row))
            .collect()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let keys = BTreeSet::from([key.clone()]);
        self.get_all_mutation_batches_affecting_document_keys(txn, &keys)
    }

    /// Batches touching any of `keys`, in batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let prefix = db_key![
                self.user_id.as_str(),
                collection_key(&key.collection_path()),
                key.id()
            ];
            for row_key in txn.scan_keys(DOCUMENT_MUTATIONS_STORE, &KeyRange::prefix(prefix))? {
                if let Some(batch_id) = batch_id_at(&row_key, 3) {
                    batch_ids.insert(batch_id);
                }
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    /// Batches touching documents that are immediate children of the
    /// query's collection.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        if query.collection_group_id().is_some() {
            return Err(internal_error(
                "Collection group queries are resolved per collection before reaching the mutation queue",
            ));
        }
        if DocumentKey::is_document_key(query.path()) {
            let key = DocumentKey::from_path(query.path().clone())?;
            return self.get_all_mutation_batches_affecting_document_key(txn, &key);
        }
        let prefix = db_key![self.user_id.as_str(), collection_key(query.path())];
        let batch_ids = txn
            .scan_keys(DOCUMENT_MUTATIONS_STORE, &KeyRange::prefix(prefix))?
            .iter()
            .filter_map(|key| batch_id_at(key, 3))
            .collect();
        self.lookup_batches(txn, batch_ids)
    }

    fn lookup_batches(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batch_ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => {
                    return Err(internal_error(format!(
                        "Dangling document-mutation reference found: batch {batch_id} does not exist"
                    )))
                }
            }
        }
        Ok(batches)
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let head = txn
            .scan_keys(MUTATIONS_STORE, &self.user_range())?
            .first()
            .and_then(|key| batch_id_at(key, 1));
        if head != Some(batch.batch_id) {
            return Err(internal_error(format!(
                "Can only remove the first entry of the mutation queue (expected {head:?}, got {})",
                batch.batch_id
            )));
        }
        txn.delete(MUTATIONS_STORE, db_key![self.user_id.as_str(), batch.batch_id])?;
        let delegate = txn.reference_delegate();
        for mutation in &batch.mutations {
            txn.delete(
                DOCUMENT_MUTATIONS_STORE,
                document_mutation_key(&self.user_id, &mutation.key, batch.batch_id),
            )?;
            delegate.mark_potentially_orphaned(txn, &mutation.key)?;
        }
        Ok(())
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        batch: &MutationBatch,
        stream_token: &[u8],
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = BASE64_STANDARD.encode(stream_token);
        txn.put(MUTATION_QUEUES_STORE, db_key![self.user_id.as_str()], &metadata)
    }

    pub fn get_last_stream_token(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<Vec<u8>> {
        let metadata = self.metadata(txn)?;
        BASE64_STANDARD
            .decode(&metadata.last_stream_token)
            .map_err(|err| data_loss(format!("Invalid stream token for user '{}': {err}", self.user_id)))
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        stream_token: &[u8],
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = BASE64_STANDARD.encode(stream_token);
        txn.put(MUTATION_QUEUES_STORE, db_key![self.user_id.as_str()], &metadata)
    }

    pub fn contains_key(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<bool> {
        user_contains_key(txn, &self.user_id, key)
    }

    /// An empty queue must not leave document-mutation rows behind.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<()> {
        if !self.check_empty(txn)? {
            return Ok(());
        }
        let dangling = txn.count(DOCUMENT_MUTATIONS_STORE, &self.user_range())?;
        if dangling > 0 {
            return Err(internal_error(format!(
                "Document leak: {dangling} document-mutation rows remain for an empty queue"
            )));
        }
        Ok(())
    }
}

fn document_mutation_key(user_id: &str, key: &DocumentKey, batch_id: BatchId) -> Vec<KeyPart> {
    db_key![
        user_id,
        collection_key(&key.collection_path()),
        key.id(),
        batch_id
    ]
}

fn batch_id_at(key: &[KeyPart], index: usize) -> Option<BatchId> {
    match key.get(index) {
        Some(KeyPart::Int(id)) => BatchId::try_from(*id).ok(),
        _ => None,
    }
}

fn user_contains_key(txn: &PersistenceTransaction<'_, '_>, user_id: &str, key: &DocumentKey) -> FirestoreResult<bool> {
    let prefix = db_key![user_id, collection_key(&key.collection_path()), key.id()];
    Ok(txn.count(DOCUMENT_MUTATIONS_STORE, &KeyRange::prefix(prefix))? > 0)
}

/// Whether any user has a pending write for `key`.
pub fn mutation_queues_contain_key(txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<bool> {
    for user_key in txn.scan_keys(MUTATION_QUEUES_STORE, &KeyRange::all())? {
        if let Some(KeyPart::Str(user_id)) = user_key.first() {
            if user_contains_key(txn, user_id, key)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::test_persistence;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn set(path: &str, n: i64) -> Mutation {
        let mut value = MapValue::empty();
        value.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        Mutation::set(DocumentKey::from_string(path).unwrap(), value)
    }

    #[tokio::test]
    async fn batches_are_ordered_and_removed_from_the_head() {
        let persistence = test_persistence().await;
        let queue = MutationQueue::new("alice", persistence.serializer().clone());
        let other = MutationQueue::new("bob", persistence.serializer().clone());

        let (first, second) = persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                let first = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a", 1)])?;
                other.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/c", 1)])?;
                let second = queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![],
                    vec![set("rooms/a", 2), set("rooms/b", 1)],
                )?;
                Ok((first, second))
            })
            .unwrap();
        assert!(second.batch_id > first.batch_id + 1);

        persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                let key = DocumentKey::from_string("rooms/a")?;
                let affecting = queue.get_all_mutation_batches_affecting_document_key(txn, &key)?;
                assert_eq!(affecting.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![first.batch_id, second.batch_id]);
                let query = Query::collection("rooms")?;
                assert_eq!(queue.get_all_mutation_batches_affecting_query(txn, &query)?.len(), 2);
                assert_eq!(queue.get_highest_unacknowledged_batch_id(txn)?, second.batch_id);
                let next = queue.get_next_mutation_batch_after_batch_id(txn, first.batch_id)?;
                assert_eq!(next.map(|b| b.batch_id), Some(second.batch_id));
                assert!(mutation_queues_contain_key(txn, &DocumentKey::from_string("rooms/c")?)?);
                Ok(())
            })
            .unwrap();

        let err = persistence
            .run_transaction("remove", TransactionMode::ReadWrite, |txn| queue.remove_mutation_batch(txn, &second))
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");

        persistence
            .run_transaction("remove", TransactionMode::ReadWrite, |txn| {
                queue.acknowledge_batch(txn, &first, b"token")?;
                queue.remove_mutation_batch(txn, &first)?;
                queue.remove_mutation_batch(txn, &second)?;
                assert!(queue.check_empty(txn)?);
                queue.perform_consistency_check(txn)?;
                assert_eq!(queue.get_last_stream_token(txn)?, b"token".to_vec());
                Ok(())
            })
            .unwrap();
    }
}
