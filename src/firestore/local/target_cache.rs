use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use crate::db_key;
use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    document_path_key, DbTarget, DbTargetDocument, DbTargetGlobal, DOCUMENT_TARGETS_STORE,
    SENTINEL_TARGET_ID, TARGETS_STORE, TARGET_CANONICAL_IDS_STORE, TARGET_DOCUMENTS_STORE,
    TARGET_GLOBAL_KEY, TARGET_GLOBAL_STORE,
};
use crate::firestore::local::simple_db::{KeyPart, KeyRange};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DocumentKey, ListenSequenceNumber, ResourcePath, SnapshotVersion, TargetId,
};

/// Persisted targets, the documents that match them and the global target
/// counters.
#[derive(Clone, Debug)]
pub struct TargetCache {
    serializer: LocalSerializer,
}

impl TargetCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn
            .get(TARGET_GLOBAL_STORE, &db_key![TARGET_GLOBAL_KEY])?
            .unwrap_or_default())
    }

    fn save_metadata(&self, txn: &mut PersistenceTransaction<'_, '_>, metadata: &DbTargetGlobal) -> FirestoreResult<()> {
        txn.put(TARGET_GLOBAL_STORE, db_key![TARGET_GLOBAL_KEY], metadata)
    }

    /// Reserves the next even target id.
    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_, '_>) -> FirestoreResult<TargetId> {
        let mut metadata = self.metadata(txn)?;
        let target_id = TargetIdGenerator::for_target_cache(metadata.highest_target_id).next();
        metadata.highest_target_id = target_id;
        self.save_metadata(txn, &metadata)?;
        Ok(target_id)
    }

    pub fn get_last_remote_snapshot_version(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(self.metadata(txn)?.last_remote_snapshot_version)
    }

    pub fn get_highest_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.metadata(txn)?.highest_listen_sequence_number)
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        Ok(self.metadata(txn)?.target_count)
    }

    pub fn set_targets_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.highest_listen_sequence_number = highest_listen_sequence_number;
        if let Some(version) = last_remote_snapshot_version {
            metadata.last_remote_snapshot_version = version;
        }
        self.save_metadata(txn, &metadata)
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_, '_>, target_data: &TargetData) -> FirestoreResult<()> {
        let row = self.serializer.encode_target_data(target_data);
        txn.put(
            TARGET_CANONICAL_IDS_STORE,
            db_key![row.canonical_id.as_str(), target_data.target_id],
            &JsonValue::Null,
        )?;
        txn.put(TARGETS_STORE, db_key![target_data.target_id], &row)
    }

    fn bump_metadata(metadata: &mut DbTargetGlobal, target_data: &TargetData) -> bool {
        let mut changed = false;
        if target_data.target_id > metadata.highest_target_id {
            metadata.highest_target_id = target_data.target_id;
            changed = true;
        }
        if target_data.sequence_number > metadata.highest_listen_sequence_number {
            metadata.highest_listen_sequence_number = target_data.sequence_number;
            changed = true;
        }
        changed
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_, '_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.metadata(txn)?;
        Self::bump_metadata(&mut metadata, target_data);
        metadata.target_count += 1;
        self.save_metadata(txn, &metadata)
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_, '_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.metadata(txn)?;
        if Self::bump_metadata(&mut metadata, target_data) {
            self.save_metadata(txn, &metadata)?;
        }
        Ok(())
    }

    /// Deletes the target and its document associations. References are
    /// dropped without notifying the reference delegate.
    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction<'_, '_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        let Some(row) = txn.get::<DbTarget>(TARGETS_STORE, &db_key![target_data.target_id])? else {
            return Ok(());
        };
        txn.delete(TARGETS_STORE, db_key![target_data.target_id])?;
        txn.delete(
            TARGET_CANONICAL_IDS_STORE,
            db_key![row.canonical_id, target_data.target_id],
        )?;
        let mut metadata = self.metadata(txn)?;
        metadata.target_count = (metadata.target_count - 1).max(0);
        self.save_metadata(txn, &metadata)
    }

    /// Drops inactive targets last used at or before `upper_bound`.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.get_all_target_data(txn)? {
            if target_data.sequence_number <= upper_bound
                && !active_target_ids.contains(&target_data.target_id)
            {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get_all_target_data(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<Vec<TargetData>> {
        txn.scan::<DbTarget>(TARGETS_STORE, &KeyRange::all())?
            .iter()
            .map(|(_, row)| self.serializer.decode_target_data(row))
            .collect()
    }

    /// Looks a target up by canonical id. Different targets may share a
    /// canonical id, so candidates are compared in full.
    pub fn get_target_data(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let range = KeyRange::prefix(db_key![target.canonical_id()]);
        for key in txn.scan_keys(TARGET_CANONICAL_IDS_STORE, &range)? {
            let Some(KeyPart::Int(target_id)) = key.get(1) else {
                continue;
            };
            let target_id = TargetId::try_from(*target_id)
                .map_err(|_| internal_error(format!("Target id {target_id} out of range")))?;
            if let Some(target_data) = self.get_target_data_for_target_id(txn, target_id)? {
                if &target_data.target == target {
                    return Ok(Some(target_data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get::<DbTarget>(TARGETS_STORE, &db_key![target_id])?
            .map(|row| self.serializer.decode_target_data(&row))
            .transpose()
    }

    pub fn add_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let delegate = txn.reference_delegate();
        for key in keys {
            let path = document_path_key(key);
            let row = DbTargetDocument::default();
            txn.put(TARGET_DOCUMENTS_STORE, db_key![target_id, path.clone()], &row)?;
            txn.put(DOCUMENT_TARGETS_STORE, db_key![path, target_id], &row)?;
            delegate.add_reference(txn, target_id, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let delegate = txn.reference_delegate();
        for key in keys {
            let path = document_path_key(key);
            txn.delete(TARGET_DOCUMENTS_STORE, db_key![target_id, path.clone()])?;
            txn.delete(DOCUMENT_TARGETS_STORE, db_key![path, target_id])?;
            delegate.remove_reference(txn, target_id, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let range = KeyRange::prefix(db_key![target_id]);
        for key in txn.scan_keys(TARGET_DOCUMENTS_STORE, &range)? {
            if let Some(path) = key.get(1) {
                txn.delete(DOCUMENT_TARGETS_STORE, vec![path.clone(), KeyPart::from(target_id)])?;
            }
        }
        txn.delete_range(TARGET_DOCUMENTS_STORE, &range)?;
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let range = KeyRange::prefix(db_key![target_id]);
        let mut keys = BTreeSet::new();
        for key in txn.scan_keys(TARGET_DOCUMENTS_STORE, &range)? {
            if let Some(KeyPart::Str(path)) = key.get(1) {
                keys.insert(DocumentKey::from_path(ResourcePath::from_string(path)?)?);
            }
        }
        Ok(keys)
    }

    /// Whether any target other than the sentinel references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_, '_>, key: &DocumentKey) -> FirestoreResult<bool> {
        let range = KeyRange::prefix(db_key![document_path_key(key)]);
        Ok(txn
            .scan_keys(DOCUMENT_TARGETS_STORE, &range)?
            .iter()
            .any(|row| !matches!(row.get(1), Some(KeyPart::Int(id)) if *id == i64::from(SENTINEL_TARGET_ID))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::local::test_persistence;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn targets_are_found_by_query_and_counted() {
        let persistence = test_persistence().await;
        let cache = TargetCache::new(persistence.serializer().clone());
        let target = Query::collection("rooms").unwrap().to_target();
        persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                let target_id = cache.allocate_target_id(txn)?;
                assert_eq!(target_id, 2);
                let data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.current_sequence_number());
                cache.add_target_data(txn, &data)?;
                cache.add_matching_keys(txn, [&key("rooms/a"), &key("rooms/b")], target_id)?;
                Ok(())
            })
            .unwrap();

        persistence
            .run_transaction("check", TransactionMode::ReadWrite, |txn| {
                let data = cache.get_target_data(txn, &target)?.expect("target");
                assert_eq!(cache.get_target_count(txn)?, 1);
                assert_eq!(cache.get_matching_keys_for_target_id(txn, data.target_id)?.len(), 2);
                assert!(cache.contains_key(txn, &key("rooms/a"))?);

                cache.remove_matching_keys(txn, [&key("rooms/a")], data.target_id)?;
                assert!(!cache.contains_key(txn, &key("rooms/a"))?);

                let removed = cache.remove_targets(txn, data.sequence_number, &BTreeSet::new())?;
                assert_eq!(removed, 1);
                assert_eq!(cache.get_target_count(txn)?, 0);
                assert!(!cache.contains_key(txn, &key("rooms/b"))?);
                assert_eq!(cache.allocate_target_id(txn)?, 4);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn active_targets_survive_removal() {
        let persistence = test_persistence().await;
        let cache = TargetCache::new(persistence.serializer().clone());
        persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                let target = Query::collection("rooms")?.to_target();
                let data = TargetData::new(target, 2, TargetPurpose::Listen, 1);
                cache.add_target_data(txn, &data)?;
                assert_eq!(cache.remove_targets(txn, 10, &BTreeSet::from([2]))?, 0);
                cache.set_targets_metadata(txn, 7, None)?;
                assert_eq!(cache.get_highest_sequence_number(txn)?, 7);
                Ok(())
            })
            .unwrap();
    }
}
