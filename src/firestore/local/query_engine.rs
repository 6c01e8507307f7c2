use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::{IndexManager, IndexType};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{Document, DocumentKey, IndexOffset, SnapshotVersion, INITIAL_LARGEST_BATCH_ID};
use crate::firestore::settings::IndexAutoCreationSettings;

/// Counters collected while running one query.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    /// Remote documents read by collection scans.
    pub documents_read_count: usize,
}

/// Picks the cheapest way to answer a query from the local cache: a field
/// index, the keys the last limbo-free snapshot matched, or a collection
/// scan.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    index_auto_creation: IndexAutoCreationSettings,
}

impl QueryEngine {
    pub fn new(index_auto_creation: IndexAutoCreationSettings) -> Self {
        Self { index_auto_creation }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation.enabled = enabled;
    }

    pub fn index_auto_creation(&self) -> &IndexAutoCreationSettings {
        &self.index_auto_creation
    }

    /// Local views of every document matching `query`.
    ///
    /// `remote_keys` are the keys the target matched as of
    /// `last_limbo_free_snapshot_version`; they let the engine read only the
    /// documents changed since then.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        local_documents: &LocalDocumentsView,
        index_manager: &IndexManager,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if let Some(results) = self.perform_query_using_index(txn, local_documents, index_manager, query)? {
            return Ok(results);
        }
        if let Some(results) = self.perform_query_using_remote_keys(
            txn,
            local_documents,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        )? {
            return Ok(results);
        }

        let mut context = QueryContext::default();
        let results = local_documents.get_documents_matching_query(txn, query, &IndexOffset::none(), &mut context)?;
        if self.index_auto_creation.enabled {
            if let Err(err) = self.create_cache_indexes(txn, index_manager, query, &context, results.len()) {
                log::warn!("failed to create cache indexes for {query}: {err}");
            }
        }
        Ok(results)
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index_manager: &IndexManager,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let settings = &self.index_auto_creation;
        if context.documents_read_count < settings.min_collection_size {
            log::debug!(
                "not creating cache indexes for {query}: only {} documents scanned, minimum is {}",
                context.documents_read_count,
                settings.min_collection_size
            );
            return Ok(());
        }
        if (context.documents_read_count as f64) > settings.relative_index_read_cost * result_size as f64 {
            index_manager.create_target_indexes(txn, &query.to_target())?;
            log::debug!(
                "created cache indexes for {query}: scanned {} documents for {result_size} results",
                context.documents_read_count
            );
        }
        Ok(())
    }

    fn perform_query_using_index(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        local_documents: &LocalDocumentsView,
        index_manager: &IndexManager,
        query: &Query,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() || query.is_document_query() {
            return Ok(None);
        }

        let target = query.to_target();
        let index_type = index_manager.get_index_type(txn, &target)?;
        if index_type == IndexType::None {
            return Ok(None);
        }
        if query.has_limit() && index_type == IndexType::Partial {
            // A partial index cannot honor the limit; query everything and
            // trim afterwards.
            let unlimited = query.clone().without_limit();
            return self.perform_query_using_index(txn, local_documents, index_manager, &unlimited);
        }

        let Some(keys) = index_manager.get_documents_matching_target(txn, &target)? else {
            return Ok(None);
        };
        let mut read = BTreeMap::new();
        for key in &keys {
            read.insert(key.clone(), local_documents.get_document(txn, key)?);
        }
        let offset = index_manager.get_min_offset(txn, &target)?;
        let previous_results = apply_query(query, read.into_values());

        if needs_refill(query, &previous_results, keys.len(), offset.read_time) {
            log::debug!("index results for {target} need a refill, falling back to a scan");
            return Ok(None);
        }
        self.append_remaining_results(txn, local_documents, previous_results, query, &offset)
            .map(Some)
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() || query.is_document_query() {
            return Ok(None);
        }
        if last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let mut documents = Vec::with_capacity(remote_keys.len());
        for key in remote_keys {
            documents.push(local_documents.get_document(txn, key)?);
        }
        let previous_results = apply_query(query, documents);
        if needs_refill(query, &previous_results, remote_keys.len(), last_limbo_free_snapshot_version) {
            return Ok(None);
        }

        log::debug!(
            "re-using previous results from {} for {query}",
            last_limbo_free_snapshot_version.timestamp().to_rfc3339()
        );
        let offset = IndexOffset::successor_of_read_time(last_limbo_free_snapshot_version, INITIAL_LARGEST_BATCH_ID);
        self.append_remaining_results(txn, local_documents, previous_results, query, &offset)
            .map(Some)
    }

    /// Merges `indexed_results` with every document changed after `offset`.
    fn append_remaining_results(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        local_documents: &LocalDocumentsView,
        indexed_results: Vec<Document>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut context = QueryContext::default();
        let mut remaining = local_documents.get_documents_matching_query(txn, query, offset, &mut context)?;
        for document in indexed_results {
            remaining.insert(document.key().clone(), document);
        }
        Ok(remaining)
    }
}

/// Filters `documents` by `query` and sorts them in query order.
fn apply_query(query: &Query, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut results: Vec<Document> = documents
        .into_iter()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| query.compare_documents(left, right));
    results
}

/// Whether a limit query computed from an older result set may be missing
/// documents: some previous match left the result, or the document at the
/// limit edge changed after `limbo_free_snapshot_version`.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[Document],
    remote_key_count: usize,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_key_count != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        None => false,
        Some(document) => document.has_pending_writes() || document.version() > limbo_free_snapshot_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Filter, Operator};
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::local::test_persistence;
    use crate::firestore::model::{FieldPath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    fn document(path: &str, size: i64, at: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), FirestoreValue::from_integer(size));
        let mut document = Document::new_found(DocumentKey::from_string(path).unwrap(), version(at), data);
        document.set_read_time(version(at));
        document
    }

    fn seed(persistence: &Persistence, documents: Vec<Document>) {
        let cache = RemoteDocumentCache::new(persistence.serializer().clone());
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                let mut buffer = cache.new_change_buffer();
                for document in &documents {
                    buffer.add_entry(document.clone());
                }
                buffer.apply(txn)
            })
            .unwrap();
    }

    fn components(persistence: &Persistence) -> (LocalDocumentsView, IndexManager) {
        let serializer = persistence.serializer().clone();
        let index_manager = IndexManager::new("");
        let view = LocalDocumentsView::new(
            RemoteDocumentCache::new(serializer.clone()),
            MutationQueue::new("", serializer.clone()),
            DocumentOverlayCache::new("", serializer),
            index_manager.clone(),
        );
        (view, index_manager)
    }

    fn large_rooms() -> Query {
        Query::collection("rooms").unwrap().with_filter(
            Filter::field(
                FieldPath::from_dot_separated("size").unwrap(),
                Operator::GreaterThan,
                FirestoreValue::from_integer(5),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn previous_results_are_reused_and_extended() {
        let persistence = test_persistence().await;
        let (view, index_manager) = components(&persistence);
        seed(
            &persistence,
            vec![document("rooms/a", 10, 1), document("rooms/b", 1, 1), document("rooms/c", 8, 5)],
        );
        let engine = QueryEngine::new(IndexAutoCreationSettings::default());
        let remote_keys = BTreeSet::from([DocumentKey::from_string("rooms/a").unwrap()]);

        let results = persistence
            .run_transaction("query", TransactionMode::ReadWrite, |txn| {
                engine.get_documents_matching_query(txn, &view, &index_manager, &large_rooms(), version(2), &remote_keys)
            })
            .unwrap();
        let keys: Vec<String> = results.keys().map(|key| key.path().canonical_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/c"]);
    }

    #[test]
    fn limit_queries_refill_when_edge_changed() {
        let query = large_rooms().with_limit_to_first(1);
        let results = vec![document("rooms/a", 10, 3)];
        assert!(needs_refill(&query, &results, 1, version(2)));
        assert!(!needs_refill(&query, &results, 1, version(4)));
        assert!(needs_refill(&query, &results, 2, version(4)));
        assert!(!needs_refill(&large_rooms(), &results, 2, version(4)));
    }

    #[tokio::test]
    async fn full_scans_create_indexes_when_selective() {
        let persistence = test_persistence().await;
        let (view, index_manager) = components(&persistence);
        seed(
            &persistence,
            (0..10).map(|i| document(&format!("rooms/r{i}"), i, 1)).collect(),
        );
        let engine = QueryEngine::new(IndexAutoCreationSettings {
            enabled: true,
            min_collection_size: 5,
            relative_index_read_cost: 2.0,
        });
        let query = Query::collection("rooms").unwrap().with_filter(
            Filter::field(
                FieldPath::from_dot_separated("size").unwrap(),
                Operator::Equal,
                FirestoreValue::from_integer(3),
            )
            .unwrap(),
        );

        let indexes = persistence
            .run_transaction("query", TransactionMode::ReadWrite, |txn| {
                let results = engine.get_documents_matching_query(
                    txn,
                    &view,
                    &index_manager,
                    &query,
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )?;
                assert_eq!(results.len(), 1);
                index_manager.get_field_indexes(txn, Some("rooms"))
            })
            .unwrap();
        assert_eq!(indexes.len(), 1);
    }

    #[tokio::test]
    async fn failed_index_creation_still_returns_results() {
        let persistence = test_persistence().await;
        let (view, index_manager) = components(&persistence);
        seed(
            &persistence,
            (0..10).map(|i| document(&format!("rooms/r{i}"), i, 1)).collect(),
        );
        let engine = QueryEngine::new(IndexAutoCreationSettings {
            enabled: true,
            min_collection_size: 5,
            relative_index_read_cost: 2.0,
        });

        // Index creation cannot write inside a read-only transaction.
        let results = persistence
            .run_transaction("query", TransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(
                    txn,
                    &view,
                    &index_manager,
                    &large_rooms(),
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )
            })
            .unwrap();
        assert_eq!(results.len(), 4);

        let indexes = persistence
            .run_transaction("indexes", TransactionMode::ReadOnly, |txn| {
                index_manager.get_field_indexes(txn, Some("rooms"))
            })
            .unwrap();
        assert!(indexes.is_empty());
    }
}
