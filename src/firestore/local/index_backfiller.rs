use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::firestore::error::{is_primary_lease_lost, is_transient_storage_error, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, Document, DocumentKey, IndexOffset};
use crate::firestore::settings::BackfillSettings;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Writes index entries for documents cached before their index existed,
/// a bounded number of documents per pass, rotating through collection
/// groups.
#[derive(Clone, Debug)]
pub struct IndexBackfiller {
    settings: BackfillSettings,
}

impl IndexBackfiller {
    pub fn new(settings: BackfillSettings) -> Self {
        Self { settings }
    }

    /// Runs one pass and returns the number of documents processed.
    pub fn write_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index_manager: &IndexManager,
        local_documents: &LocalDocumentsView,
    ) -> FirestoreResult<usize> {
        let mut processed_groups = BTreeSet::new();
        let mut remaining = self.settings.max_documents_to_process;
        while remaining > 0 {
            let Some(collection_group) = index_manager.get_next_collection_group_to_update(txn)? else {
                break;
            };
            if !processed_groups.insert(collection_group.clone()) {
                break;
            }
            log::debug!("processing collection group {collection_group}");
            let written = self.write_entries_for_collection_group(
                txn,
                index_manager,
                local_documents,
                &collection_group,
                remaining,
            )?;
            remaining = remaining.saturating_sub(written);
        }
        Ok(self.settings.max_documents_to_process - remaining)
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index_manager: &IndexManager,
        local_documents: &LocalDocumentsView,
        collection_group: &str,
        limit: usize,
    ) -> FirestoreResult<usize> {
        let existing_offset = index_manager.get_min_offset_from_collection_group(txn, collection_group)?;
        let (largest_batch_id, documents) =
            local_documents.get_next_documents(txn, collection_group, &existing_offset, limit)?;
        index_manager.update_index_entries(txn, &documents)?;

        let new_offset = new_offset(&existing_offset, largest_batch_id, &documents);
        log::debug!(
            "updating offset for {collection_group} to {} / {}",
            new_offset.read_time,
            new_offset.document_key
        );
        index_manager.update_collection_group(txn, collection_group, &new_offset)?;
        Ok(documents.len())
    }
}

fn new_offset(
    existing: &IndexOffset,
    largest_batch_id: BatchId,
    documents: &BTreeMap<DocumentKey, Document>,
) -> IndexOffset {
    let max = documents
        .values()
        .map(IndexOffset::from_document)
        .fold(existing.clone(), |max, offset| if offset > max { offset } else { max });
    IndexOffset::new(
        max.read_time,
        max.document_key,
        largest_batch_id.max(existing.largest_batch_id),
    )
}

/// Runs the backfiller on the queue while this client is primary.
pub struct IndexBackfillerScheduler {
    backfiller: IndexBackfiller,
    queue: AsyncQueue,
    task: Mutex<Option<DelayedOperation>>,
    has_run: Mutex<bool>,
}

impl IndexBackfillerScheduler {
    pub fn new(backfiller: IndexBackfiller, queue: AsyncQueue) -> Arc<Self> {
        Arc::new(Self {
            backfiller,
            queue,
            task: Mutex::new(None),
            has_run: Mutex::new(false),
        })
    }

    pub fn start(self: &Arc<Self>, local_store: Weak<LocalStore>) {
        self.schedule(local_store);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.cancel();
        }
    }

    pub fn started(&self) -> bool {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn schedule(self: &Arc<Self>, local_store: Weak<LocalStore>) {
        let delay = {
            let mut has_run = self.has_run.lock().unwrap_or_else(PoisonError::into_inner);
            let delay = if *has_run {
                self.backfiller.settings.regular_interval
            } else {
                self.backfiller.settings.initial_delay
            };
            *has_run = true;
            delay
        };
        log::debug!("index backfill scheduled in {}ms", delay.as_millis());

        let scheduler = Arc::downgrade(self);
        let task = self.queue.enqueue_after_delay(TimerId::IndexBackfill, delay, move || async move {
            let Some(scheduler) = scheduler.upgrade() else {
                return Ok(());
            };
            scheduler.task.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(store) = local_store.upgrade() else {
                return Ok(());
            };
            match store.backfill_indexes(&scheduler.backfiller) {
                Ok(processed) => log::debug!("index backfill processed {processed} documents"),
                Err(err) if is_primary_lease_lost(&err) || is_transient_storage_error(&err) => {
                    log::debug!("ignoring error during index backfill: {err}");
                }
                Err(err) => return Err(err),
            }
            scheduler.schedule(local_store);
            Ok(())
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Filter, Operator, Query};
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::{FieldIndex, FieldPath, IndexKind, IndexSegment, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn document(path: &str, size: i64, read_at: i64) -> Document {
        let version = SnapshotVersion::from_timestamp(Timestamp::new(read_at, 0));
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), FirestoreValue::from_integer(size));
        let mut document = Document::new_found(DocumentKey::from_string(path).unwrap(), version, data);
        document.set_read_time(version);
        document
    }

    #[tokio::test]
    async fn backfills_in_bounded_passes() {
        let persistence = test_persistence().await;
        let serializer = persistence.serializer().clone();
        let remote = RemoteDocumentCache::new(serializer.clone());
        let index_manager = IndexManager::new("");
        let view = LocalDocumentsView::new(
            remote.clone(),
            MutationQueue::new("", serializer.clone()),
            DocumentOverlayCache::new("", serializer),
            index_manager.clone(),
        );
        let backfiller = IndexBackfiller::new(BackfillSettings {
            max_documents_to_process: 2,
            ..BackfillSettings::default()
        });
        let size = FieldPath::from_dot_separated("size").unwrap();

        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                let mut buffer = remote.new_change_buffer();
                buffer.add_entry(document("rooms/a", 1, 1));
                buffer.add_entry(document("rooms/b", 2, 2));
                buffer.add_entry(document("rooms/c", 3, 3));
                buffer.apply(txn)?;
                index_manager.add_field_index(
                    txn,
                    &FieldIndex::new("rooms", vec![IndexSegment::new(size.clone(), IndexKind::Ascending)]),
                )?;
                Ok(())
            })
            .unwrap();

        let run = || {
            persistence
                .run_transaction("backfill", TransactionMode::ReadWritePrimary, |txn| {
                    backfiller.write_index_entries(txn, &index_manager, &view)
                })
                .unwrap()
        };
        assert_eq!(run(), 2);
        assert_eq!(run(), 1);
        assert_eq!(run(), 0);

        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(Filter::field(size, Operator::GreaterThanOrEqual, FirestoreValue::from_integer(2)).unwrap());
        let keys = persistence
            .run_transaction("scan", TransactionMode::ReadOnly, |txn| {
                index_manager.get_documents_matching_target(txn, &query.to_target())
            })
            .unwrap()
            .unwrap();
        assert_eq!(
            keys,
            vec![
                DocumentKey::from_string("rooms/b").unwrap(),
                DocumentKey::from_string("rooms/c").unwrap()
            ]
        );
    }
}
