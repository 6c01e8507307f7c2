//! Client-side field indexes over cached documents.
//!
//! Each index entry stores the encoded `Contains` value (empty when the
//! index has no array segment) and the concatenated encodings of the
//! directional segments, so a conjunctive query becomes one range scan per
//! DNF term. Scans may return more documents than match; callers always
//! re-apply the query.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde_json::Value as JsonValue;

use crate::db_key;
use crate::firestore::core::dnf::dnf_terms;
use crate::firestore::core::{Filter, Operator, Target};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::index_encoding::{encode_segment, UPPER_SENTINEL};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_key, document_path_key, DbIndexConfiguration, DbIndexState,
    COLLECTION_PARENTS_STORE, INDEX_CONFIGURATION_STORE, INDEX_ENTRIES_BY_DOCUMENT_STORE,
    INDEX_ENTRIES_STORE, INDEX_STATE_STORE,
};
use crate::firestore::local::simple_db::{DbKey, KeyPart, KeyRange};
use crate::firestore::local::target_index_matcher::TargetIndexMatcher;
use crate::firestore::model::{
    Document, DocumentKey, FieldIndex, IndexKind, IndexOffset, IndexState, ListenSequenceNumber,
    ResourcePath, INITIAL_SEQUENCE_NUMBER,
};
use crate::firestore::value::ValueKind;

/// How well the configured indexes cover a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// At least one DNF term has no usable index.
    None,
    /// Every term has an index, but some filter or ordering is not part of
    /// it, so a limit cannot be applied to the scan.
    Partial,
    Full,
}

/// Records that `collection_path` holds documents, so collection group
/// queries can find every parent that contains the group.
pub fn add_to_collection_parent_index(
    txn: &mut PersistenceTransaction<'_, '_>,
    collection_path: &ResourcePath,
) -> FirestoreResult<()> {
    if collection_path.len() % 2 != 1 {
        return Ok(());
    }
    let Some(collection_id) = collection_path.last_segment() else {
        return Ok(());
    };
    let parent = collection_path.parent();
    txn.put(
        COLLECTION_PARENTS_STORE,
        db_key![collection_id, collection_key(&parent)],
        &JsonValue::Null,
    )
}

/// One row of the index: `(array_value, directional_value)`.
type IndexEntry = (Vec<u8>, Vec<u8>);

#[derive(Clone, Debug)]
pub struct IndexManager {
    user_id: String,
}

impl IndexManager {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Parent paths of every collection named `collection_id`.
    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let range = KeyRange::prefix(db_key![collection_id]);
        let mut parents = Vec::new();
        for key in txn.scan_keys(COLLECTION_PARENTS_STORE, &range)? {
            if let Some(KeyPart::Str(parent)) = key.get(1) {
                parents.push(ResourcePath::from_string(parent)?);
            }
        }
        Ok(parents)
    }

    /// Persists `index` under a fresh id and returns the id.
    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index: &FieldIndex,
    ) -> FirestoreResult<i32> {
        let next_id = match txn.scan_keys(INDEX_CONFIGURATION_STORE, &KeyRange::all())?.last() {
            Some(key) => match key.first() {
                Some(KeyPart::Int(id)) => *id as i32 + 1,
                _ => 1,
            },
            None => 1,
        };
        let mut stored: DbIndexConfiguration = index.clone();
        stored.index_id = next_id;
        stored.index_state = IndexState::empty();
        txn.put(INDEX_CONFIGURATION_STORE, db_key![next_id], &stored)?;
        self.put_state(txn, next_id, &index.index_state)?;
        log::debug!(
            "added field index {next_id} on '{}' with {} segments",
            index.collection_group,
            index.segments.len()
        );
        Ok(next_id)
    }

    pub fn delete_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index: &FieldIndex,
    ) -> FirestoreResult<()> {
        let id = index.index_id;
        txn.delete(INDEX_CONFIGURATION_STORE, db_key![id])?;
        txn.delete_range(INDEX_STATE_STORE, &KeyRange::prefix(db_key![id]))?;
        txn.delete_range(INDEX_ENTRIES_STORE, &KeyRange::prefix(db_key![id]))?;
        txn.delete_range(INDEX_ENTRIES_BY_DOCUMENT_STORE, &KeyRange::prefix(db_key![id]))?;
        Ok(())
    }

    pub fn delete_all_field_indexes(&self, txn: &mut PersistenceTransaction<'_, '_>) -> FirestoreResult<()> {
        for store in [
            INDEX_CONFIGURATION_STORE,
            INDEX_STATE_STORE,
            INDEX_ENTRIES_STORE,
            INDEX_ENTRIES_BY_DOCUMENT_STORE,
        ] {
            txn.delete_range(store, &KeyRange::all())?;
        }
        Ok(())
    }

    /// Configured indexes with this user's backfill state, optionally
    /// restricted to one collection group.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_group: Option<&str>,
    ) -> FirestoreResult<Vec<FieldIndex>> {
        let mut indexes = Vec::new();
        for (_, mut index) in txn.scan::<DbIndexConfiguration>(INDEX_CONFIGURATION_STORE, &KeyRange::all())? {
            if collection_group.is_some_and(|group| group != index.collection_group) {
                continue;
            }
            let state: Option<DbIndexState> =
                txn.get(INDEX_STATE_STORE, &db_key![index.index_id, self.user_id.as_str()])?;
            index.index_state = state.map(decode_state).unwrap_or_else(IndexState::empty);
            indexes.push(index);
        }
        Ok(indexes)
    }

    /// The index with the most segments that can serve `target`.
    pub fn get_field_index(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target: &Target,
    ) -> FirestoreResult<Option<FieldIndex>> {
        let matcher = TargetIndexMatcher::new(target);
        let Some(collection_group) = target.collection_id() else {
            return Ok(None);
        };
        Ok(self
            .get_field_indexes(txn, Some(collection_group))?
            .into_iter()
            .filter(|index| matcher.served_by_index(index))
            .fold(None, |best: Option<FieldIndex>, candidate| match best {
                Some(best) if best.segments.len() >= candidate.segments.len() => Some(best),
                _ => Some(candidate),
            }))
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction<'_, '_>, target: &Target) -> FirestoreResult<IndexType> {
        let sub_targets = sub_targets(target);
        let mut index_type = IndexType::Full;
        for sub_target in &sub_targets {
            match self.get_field_index(txn, sub_target)? {
                None => return Ok(IndexType::None),
                Some(index) if index.segments.len() < segment_count(sub_target) => {
                    index_type = IndexType::Partial;
                }
                Some(_) => {}
            }
        }
        if target.limit().is_some() && sub_targets.len() > 1 && index_type == IndexType::Full {
            return Ok(IndexType::Partial);
        }
        Ok(index_type)
    }

    /// Adds the index each DNF term of `target` would want, unless the term
    /// is already fully indexed.
    pub fn create_target_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target: &Target,
    ) -> FirestoreResult<()> {
        for sub_target in sub_targets(target) {
            if self.get_index_type(txn, &sub_target)? == IndexType::Full {
                continue;
            }
            let index = TargetIndexMatcher::new(&sub_target).build_target_index();
            if !index.segments.is_empty() {
                self.add_field_index(txn, &index)?;
            }
        }
        Ok(())
    }

    /// Keys of documents the indexes say may match `target`, or `None` when
    /// some DNF term cannot be served.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target: &Target,
    ) -> FirestoreResult<Option<Vec<DocumentKey>>> {
        let mut keys = BTreeSet::new();
        for sub_target in sub_targets(target) {
            let Some(index) = self.get_field_index(txn, &sub_target)? else {
                return Ok(None);
            };
            let Some(range) = self.scan_range(&index, &sub_target) else {
                return Ok(None);
            };
            for row_key in txn.scan_keys(INDEX_ENTRIES_STORE, &range)? {
                if let Some(KeyPart::Str(path)) = row_key.get(4) {
                    keys.insert(DocumentKey::from_path(ResourcePath::from_string(path)?)?);
                }
            }
        }
        Ok(Some(keys.into_iter().collect()))
    }

    fn scan_range(&self, index: &FieldIndex, target: &Target) -> Option<KeyRange> {
        let array_value = match index.array_segment() {
            Some(segment) => {
                let filter = target
                    .field_filters_for(&segment.field_path)
                    .into_iter()
                    .find(|filter| filter.op == Operator::ArrayContains)?;
                encode_segment(&filter.value, IndexKind::Ascending)
            }
            None => Vec::new(),
        };

        let mut prefix = Vec::new();
        let mut lower_tail = Vec::new();
        let mut upper_tail = Vec::new();
        for segment in index.directional_segments() {
            let filters = target.field_filters_for(&segment.field_path);
            if let Some(equal) = filters.iter().find(|filter| filter.op == Operator::Equal) {
                prefix.extend(encode_segment(&equal.value, segment.kind));
                continue;
            }
            let mut lower = None;
            let mut upper = None;
            for filter in filters {
                match filter.op {
                    Operator::GreaterThan | Operator::GreaterThanOrEqual if lower.is_none() => {
                        lower = Some(&filter.value)
                    }
                    Operator::LessThan | Operator::LessThanOrEqual if upper.is_none() => {
                        upper = Some(&filter.value)
                    }
                    _ => {}
                }
            }
            if segment.kind == IndexKind::Descending {
                std::mem::swap(&mut lower, &mut upper);
            }
            if let Some(value) = lower {
                lower_tail = encode_segment(value, segment.kind);
            }
            if let Some(value) = upper {
                upper_tail = encode_segment(value, segment.kind);
            }
            break;
        }

        let mut lower = prefix.clone();
        lower.extend(lower_tail);
        let mut upper = prefix;
        upper.extend(upper_tail);
        upper.push(UPPER_SENTINEL);

        let base = db_key![index.index_id, self.user_id.as_str(), array_value.clone()];
        Some(KeyRange::prefix(base).with_bounds(
            Bound::Included(db_key![index.index_id, self.user_id.as_str(), array_value.clone(), lower]),
            Bound::Included(db_key![index.index_id, self.user_id.as_str(), array_value, upper]),
        ))
    }

    /// Rewrites the index entries of `documents` for every index on their
    /// collection group.
    pub fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        documents: &BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<()> {
        let mut indexes_by_group: BTreeMap<String, Vec<FieldIndex>> = BTreeMap::new();
        for (key, document) in documents {
            let group = key.collection_group().to_string();
            if !indexes_by_group.contains_key(&group) {
                let indexes = self.get_field_indexes(txn, Some(&group))?;
                indexes_by_group.insert(group.clone(), indexes);
            }
            for index in indexes_by_group.get(&group).into_iter().flatten() {
                let existing = self.existing_entries(txn, index, key)?;
                let computed = compute_index_entries(index, document);
                if existing != computed {
                    self.update_entries(txn, index, key, &existing, &computed)?;
                }
            }
        }
        Ok(())
    }

    fn existing_entries(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        index: &FieldIndex,
        key: &DocumentKey,
    ) -> FirestoreResult<BTreeSet<IndexEntry>> {
        let range = KeyRange::prefix(db_key![
            index.index_id,
            self.user_id.as_str(),
            document_path_key(key)
        ]);
        let mut entries = BTreeSet::new();
        for row_key in txn.scan_keys(INDEX_ENTRIES_BY_DOCUMENT_STORE, &range)? {
            if let (Some(KeyPart::Bytes(array)), Some(KeyPart::Bytes(directional))) = (row_key.get(3), row_key.get(4)) {
                entries.insert((array.clone(), directional.clone()));
            }
        }
        Ok(entries)
    }

    fn update_entries(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index: &FieldIndex,
        key: &DocumentKey,
        existing: &BTreeSet<IndexEntry>,
        computed: &BTreeSet<IndexEntry>,
    ) -> FirestoreResult<()> {
        let path = document_path_key(key);
        for (array, directional) in existing.difference(computed) {
            let (entry_key, by_document_key) = self.entry_keys(index, &path, array, directional);
            txn.delete(INDEX_ENTRIES_STORE, entry_key)?;
            txn.delete(INDEX_ENTRIES_BY_DOCUMENT_STORE, by_document_key)?;
        }
        for (array, directional) in computed.difference(existing) {
            let (entry_key, by_document_key) = self.entry_keys(index, &path, array, directional);
            txn.put(INDEX_ENTRIES_STORE, entry_key, &JsonValue::Null)?;
            txn.put(INDEX_ENTRIES_BY_DOCUMENT_STORE, by_document_key, &JsonValue::Null)?;
        }
        Ok(())
    }

    fn entry_keys(&self, index: &FieldIndex, path: &str, array: &[u8], directional: &[u8]) -> (DbKey, DbKey) {
        let user = self.user_id.as_str();
        (
            db_key![index.index_id, user, array.to_vec(), directional.to_vec(), path],
            db_key![index.index_id, user, path, array.to_vec(), directional.to_vec()],
        )
    }

    /// The collection group whose indexes were backfilled least recently.
    pub fn get_next_collection_group_to_update(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Option<String>> {
        let indexes = self.get_field_indexes(txn, None)?;
        Ok(indexes
            .into_iter()
            .min_by(|left, right| {
                left.index_state
                    .sequence_number
                    .cmp(&right.index_state.sequence_number)
                    .then_with(|| left.collection_group.cmp(&right.collection_group))
            })
            .map(|index| index.collection_group))
    }

    /// Marks every index of `collection_group` as backfilled up to `offset`.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        collection_group: &str,
        offset: &IndexOffset,
    ) -> FirestoreResult<()> {
        let sequence_number = self.next_sequence_number(txn)?;
        let state = IndexState::new(sequence_number, offset.clone());
        for index in self.get_field_indexes(txn, Some(collection_group))? {
            self.put_state(txn, index.index_id, &state)?;
        }
        Ok(())
    }

    fn next_sequence_number(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<ListenSequenceNumber> {
        let highest = txn
            .scan::<DbIndexState>(INDEX_STATE_STORE, &KeyRange::all())?
            .into_iter()
            .map(|(_, state)| state.sequence_number)
            .max()
            .unwrap_or(INITIAL_SEQUENCE_NUMBER);
        Ok(highest + 1)
    }

    fn put_state(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        index_id: i32,
        state: &IndexState,
    ) -> FirestoreResult<()> {
        let row = DbIndexState {
            sequence_number: state.sequence_number,
            read_time: state.offset.read_time,
            document_key: state.offset.document_key.clone(),
            largest_batch_id: state.offset.largest_batch_id,
        };
        txn.put(INDEX_STATE_STORE, db_key![index_id, self.user_id.as_str()], &row)
    }

    /// The oldest backfill offset among the indexes serving `target`.
    pub fn get_min_offset(&self, txn: &PersistenceTransaction<'_, '_>, target: &Target) -> FirestoreResult<IndexOffset> {
        let mut indexes = Vec::new();
        for sub_target in sub_targets(target) {
            let index = self
                .get_field_index(txn, &sub_target)?
                .ok_or_else(|| internal_error(format!("No index serves target {target}")))?;
            indexes.push(index);
        }
        Ok(min_offset(&indexes))
    }

    pub fn get_min_offset_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_group: &str,
    ) -> FirestoreResult<IndexOffset> {
        Ok(min_offset(&self.get_field_indexes(txn, Some(collection_group))?))
    }
}

fn decode_state(row: DbIndexState) -> IndexState {
    IndexState::new(
        row.sequence_number,
        IndexOffset::new(row.read_time, row.document_key, row.largest_batch_id),
    )
}

fn min_offset(indexes: &[FieldIndex]) -> IndexOffset {
    let mut offsets = indexes.iter().map(|index| &index.index_state.offset);
    let Some(first) = offsets.next() else {
        return IndexOffset::none();
    };
    let mut min = first.clone();
    let mut max_batch_id = first.largest_batch_id;
    for offset in offsets {
        if *offset < min {
            min = offset.clone();
        }
        max_batch_id = max_batch_id.max(offset.largest_batch_id);
    }
    min.largest_batch_id = max_batch_id;
    min
}

/// One conjunctive target per DNF term of `target`'s filters.
fn sub_targets(target: &Target) -> Vec<Target> {
    if target.filters().is_empty() {
        return vec![target.clone()];
    }
    dnf_terms(target.filters())
        .into_iter()
        .map(|term| {
            Target::new(
                target.path().clone(),
                target.collection_group().map(str::to_string),
                term.into_iter().map(Filter::Field).collect(),
                target.order_by().to_vec(),
                target.limit(),
                target.start_at().cloned(),
                target.end_at().cloned(),
            )
        })
        .collect()
}

/// Number of index segments needed to serve `target` fully.
fn segment_count(target: &Target) -> usize {
    let mut fields = BTreeSet::new();
    let mut has_array_segment = false;
    for filter in target.filters().iter().flat_map(Filter::flattened) {
        if filter.field.is_key_field() {
            continue;
        }
        if matches!(filter.op, Operator::ArrayContains | Operator::ArrayContainsAny) {
            has_array_segment = true;
        } else {
            fields.insert(&filter.field);
        }
    }
    for order in target.order_by() {
        if !order.field.is_key_field() {
            fields.insert(&order.field);
        }
    }
    fields.len() + usize::from(has_array_segment)
}

fn compute_index_entries(index: &FieldIndex, document: &Document) -> BTreeSet<IndexEntry> {
    let mut entries = BTreeSet::new();
    let mut directional = Vec::new();
    for segment in index.directional_segments() {
        let Some(value) = document.field(&segment.field_path) else {
            return entries;
        };
        directional.extend(encode_segment(value, segment.kind));
    }
    match index.array_segment() {
        Some(segment) => {
            if let Some(ValueKind::Array(array)) = document.field(&segment.field_path).map(|v| v.kind()) {
                for element in array.values() {
                    entries.insert((encode_segment(element, IndexKind::Ascending), directional.clone()));
                }
            }
        }
        None => {
            entries.insert((Vec::new(), directional));
        }
    }
    entries
}
