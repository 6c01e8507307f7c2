use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::firestore::error::{is_primary_lease_lost, is_transient_storage_error, FirestoreResult};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{ListenSequenceNumber, TargetId};
use crate::firestore::settings::{LruSettings, CACHE_SIZE_UNLIMITED};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Outcome of one collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Least-recently-used collection over targets and orphaned documents,
/// ranked by the sequence number of their last use.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    cache_size_bytes: i64,
    settings: LruSettings,
    target_cache: TargetCache,
    remote_documents: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(cache_size_bytes: i64, settings: LruSettings, serializer: LocalSerializer) -> Self {
        Self {
            cache_size_bytes,
            settings,
            target_cache: TargetCache::new(serializer.clone()),
            remote_documents: RemoteDocumentCache::new(serializer),
        }
    }

    pub fn settings(&self) -> &LruSettings {
        &self.settings
    }

    /// Byte size of the cached remote documents.
    pub fn get_cache_size(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        self.remote_documents.get_size(txn)
    }

    /// Number of sequence numbers a pass collects: the configured
    /// percentile of everything tracked, capped.
    pub fn calculate_targets_to_collect(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<usize> {
        let count = txn.reference_delegate().sequence_number_count(txn)?;
        let percentile = self.settings.percentile_to_collect as usize;
        Ok((percentile * count / 100).min(self.settings.maximum_sequence_numbers_to_collect))
    }

    /// The `n`th smallest sequence number among targets and orphaned
    /// documents.
    pub fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        n: usize,
    ) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut sequence_numbers: Vec<ListenSequenceNumber> = self
            .target_cache
            .get_all_target_data(txn)?
            .into_iter()
            .map(|target_data| target_data.sequence_number)
            .collect();
        sequence_numbers.extend(
            txn.reference_delegate()
                .orphaned_documents(txn)?
                .into_iter()
                .map(|(_, sequence_number)| sequence_number),
        );
        sequence_numbers.sort_unstable();
        Ok(sequence_numbers
            .get(n.min(sequence_numbers.len()).saturating_sub(1))
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER))
    }

    /// Runs a pass if the cache is over its size threshold. Targets in
    /// `active_target_ids` are never removed.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        if self.cache_size_bytes == CACHE_SIZE_UNLIMITED {
            log::debug!("garbage collection skipped; disabled");
            return Ok(LruResults::skipped());
        }
        let cache_size = self.get_cache_size(txn)?;
        if cache_size < self.cache_size_bytes {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.cache_size_bytes
            );
            return Ok(LruResults::skipped());
        }
        self.run_garbage_collection(txn, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        let sequence_numbers_collected = self.calculate_targets_to_collect(txn)?;
        let upper_bound = self.nth_sequence_number(txn, sequence_numbers_collected)?;
        let targets_removed = self.target_cache.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = txn
            .reference_delegate()
            .remove_orphaned_documents(txn, upper_bound)?;
        log::debug!(
            "LRU garbage collection: collected {sequence_numbers_collected} sequence numbers up to \
             {upper_bound}, removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected,
            targets_removed,
            documents_removed,
        })
    }
}

/// Runs LRU collection on the queue at a fixed interval while this client
/// is primary.
pub struct LruScheduler {
    collector: Arc<LruGarbageCollector>,
    queue: AsyncQueue,
    task: Mutex<Option<DelayedOperation>>,
    has_run: Mutex<bool>,
}

impl LruScheduler {
    pub fn new(collector: Arc<LruGarbageCollector>, queue: AsyncQueue) -> Arc<Self> {
        Arc::new(Self {
            collector,
            queue,
            task: Mutex::new(None),
            has_run: Mutex::new(false),
        })
    }

    pub fn start(self: &Arc<Self>, local_store: Weak<LocalStore>) {
        if self.collector.cache_size_bytes == CACHE_SIZE_UNLIMITED {
            return;
        }
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
                self.collector.settings.regular_interval
            } else {
                self.collector.settings.initial_delay
            };
            *has_run = true;
            delay
        };
        log::debug!("garbage collection scheduled in {}ms", delay.as_millis());

        let scheduler = Arc::downgrade(self);
        let task = self.queue.enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
            let Some(scheduler) = scheduler.upgrade() else {
                return Ok(());
            };
            scheduler.task.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(store) = local_store.upgrade() else {
                return Ok(());
            };
            match store.collect_garbage(&scheduler.collector) {
                Ok(_) => {}
                Err(err) if is_primary_lease_lost(&err) || is_transient_storage_error(&err) => {
                    log::debug!("ignoring error during garbage collection: {err}");
                }
                Err(err) => return Err(err),
            }
            scheduler.schedule(local_store);
            Ok(())
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}
