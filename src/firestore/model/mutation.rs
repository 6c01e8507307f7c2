//! Write operations and their pure application to documents.

use std::collections::BTreeSet;

use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` or one of its parents is in the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with(&mut self, other: impl IntoIterator<Item = FieldPath>) {
        self.fields.extend(other);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Result of applying the transform on the client.
    fn apply_locally(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_kind(ValueKind::Array(coerce_array(previous).union(elements)))
            }
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_kind(
                ValueKind::Array(coerce_array(previous).remove_all(elements)),
            ),
            TransformOperation::NumericIncrement(operand) => {
                let base = previous
                    .filter(|value| value.is_number())
                    .cloned()
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Result after the server acknowledged the write. Array transforms are
    /// recomputed because the backend does not echo their result.
    fn apply_remotely(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: Option<&FirestoreValue>,
    ) -> FirestoreValue {
        match (self, server_result) {
            (TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_), _) => {
                self.apply_locally(previous, Timestamp::default())
            }
            (_, Some(result)) => result.clone(),
            (_, None) => self.apply_locally(previous, Timestamp::now()),
        }
    }

    /// Value to persist as a base for idempotent re-application, if any.
    fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(
                previous
                    .filter(|value| value.is_number())
                    .cloned()
                    .unwrap_or_else(|| FirestoreValue::from_integer(0)),
            ),
            _ => None,
        }
    }
}

fn coerce_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => {
            FirestoreValue::from_integer(a.saturating_add(*b))
        }
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the masked fields; fields in the mask missing from `value`
    /// are deleted.
    Patch { value: MapValue, mask: FieldMask },
    Delete,
    /// Only asserts the precondition at commit time.
    Verify,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub key: DocumentKey,
    pub kind: MutationKind,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

/// Server acknowledgement of a single mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// A patch that requires the document to exist, as produced by updates.
    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { value, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    /// Fields this mutation may change, or `None` when it rewrites the
    /// whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => {
                let mut fields = mask.clone();
                fields.union_with(self.field_transforms.iter().map(|t| t.field.clone()));
                Some(fields)
            }
            MutationKind::Verify => Some(FieldMask::empty()),
            MutationKind::Set { .. } | MutationKind::Delete => None,
        }
    }

    /// Applies the mutation to the locally cached `document` as a pending
    /// write. `previous_mask` carries the fields changed by earlier
    /// mutations in the same squash; `None` means the whole document.
    /// Returns the combined mask after this mutation.
    ///
    /// A failed precondition leaves the document untouched.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        debug_assert_eq!(document.key(), &self.key);
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                let version = document.version();
                document.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                patch_fields(&mut data, value, mask);
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                let version = document.version();
                document.convert_to_found(version, data).set_has_local_mutations();
                previous_mask.map(|mut combined| {
                    combined.union_with(mask.fields().iter().cloned());
                    combined.union_with(self.field_transforms.iter().map(|t| t.field.clone()));
                    combined
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the remote document cache entry.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let mut data = value.clone();
                let transform_results =
                    self.remote_transform_results(document, &result.transform_results);
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The patch was applied on the server to a document we do
                    // not have; its content is unknown until the next fetch.
                    document.convert_to_unknown(result.version);
                    return;
                }
                let transform_results =
                    self.remote_transform_results(document, &result.transform_results);
                let mut data = document.data().clone();
                patch_fields(&mut data, value, mask);
                apply_transform_results(&mut data, &self.field_transforms, transform_results);
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Base values for transforms that are not idempotent, computed against
    /// the current local view. Persisted alongside the batch so a replay
    /// after restart produces the same local result.
    pub fn extract_transform_base_value(&self, document: &Document) -> Option<MapValue> {
        let mut base = MapValue::empty();
        for transform in &self.field_transforms {
            let existing = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base.set(&transform.field, value);
            }
        }
        (!base.is_empty()).then_some(base)
    }

    fn local_transform_results(
        &self,
        document: &Document,
        local_write_time: Timestamp,
    ) -> Vec<FirestoreValue> {
        self.field_transforms
            .iter()
            .map(|transform| {
                transform
                    .operation
                    .apply_locally(document.field(&transform.field), local_write_time)
            })
            .collect()
    }

    fn remote_transform_results(
        &self,
        document: &Document,
        server_results: &[FirestoreValue],
    ) -> Vec<FirestoreValue> {
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(i, transform)| {
                transform
                    .operation
                    .apply_remotely(document.field(&transform.field), server_results.get(i))
            })
            .collect()
    }
}

fn patch_fields(data: &mut MapValue, value: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        if path.is_empty() {
            continue;
        }
        match value.field(path) {
            Some(new_value) => data.set(path, new_value.clone()),
            None => data.delete(path),
        }
    }
}

fn apply_transform_results(
    data: &mut MapValue,
    transforms: &[FieldTransform],
    results: Vec<FirestoreValue>,
) {
    for (transform, result) in transforms.iter().zip(results) {
        data.set(&transform.field, result);
    }
}

/// The single mutation that turns the remote version of `document` into its
/// current local view, given the fields changed by pending writes.
///
/// Returns `None` when the document has no local mutations or nothing
/// changed.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        let key = document.key().clone();
        return Some(if document.is_no_document() {
            Mutation::delete(key)
        } else {
            Mutation::set(key, document.data().clone())
        });
    };

    let mut patch_value = MapValue::empty();
    let mut patch_mask = BTreeSet::new();
    for path in mask.fields() {
        if patch_mask.iter().any(|existing: &FieldPath| existing.is_prefix_of(path)) {
            continue;
        }
        // A missing leaf whose parent is also missing is recorded at the
        // parent so the patch deletes the whole subtree.
        let mut target = path.clone();
        while document.field(&target).is_none() {
            match target.parent() {
                Some(parent) if document.field(&parent).is_none() => target = parent,
                _ => break,
            }
        }
        if let Some(value) = document.field(&target) {
            patch_value.set(&target, value.clone());
        }
        patch_mask.insert(target);
    }

    Some(
        Mutation::patch(document.key().clone(), patch_value, FieldMask::new(patch_mask))
            .with_precondition(Precondition::None),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("docs/a").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_then_patch_merges_locally() {
        let mut document = Document::new_invalid(key());
        let set = Mutation::set(key(), map(&[("x", 1.into()), ("y", 2.into())]));
        let mask = set.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::new(1, 0));
        assert!(mask.is_none());
        assert!(document.has_local_mutations());

        let patch = Mutation::patch(key(), map(&[("x", 5.into())]), FieldMask::new([path("x"), path("y")]));
        let mask = patch.apply_to_local_view(&mut document, mask, Timestamp::new(1, 0));
        assert!(mask.is_none());
        assert_eq!(document.field(&path("x")), Some(&FirestoreValue::from(5)));
        assert!(document.field(&path("y")).is_none());
    }

    #[test]
    fn failed_precondition_is_a_no_op() {
        let mut document = Document::new_no_document(key(), version(1));
        let patch = Mutation::patch(key(), map(&[("x", 1.into())]), FieldMask::new([path("x")]));
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::new(1, 0));
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(document.is_no_document());
        assert!(!document.has_local_mutations());
    }

    #[test]
    fn increments_and_array_transforms_apply_locally() {
        let mut document = Document::new_found(
            key(),
            version(1),
            map(&[("count", 2.into()), ("tags", FirestoreValue::from_array(vec!["a".into()]))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_transform(path("count"), TransformOperation::NumericIncrement(3.into()))
            .with_transform(path("tags"), TransformOperation::ArrayUnion(vec!["a".into(), "b".into()]))
            .with_transform(path("at"), TransformOperation::ServerTimestamp);
        let base = mutation.extract_transform_base_value(&document).unwrap();
        assert_eq!(base.field(&path("count")), Some(&FirestoreValue::from(2)));

        let mask = mutation.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::new(9, 0));
        assert_eq!(document.field(&path("count")), Some(&FirestoreValue::from(5)));
        assert_eq!(document.field(&path("tags")).and_then(FirestoreValue::as_array).map(ArrayValue::len), Some(2));
        assert_eq!(document.field(&path("at")), Some(&FirestoreValue::from_timestamp(Timestamp::new(9, 0))));
        assert_eq!(mask.unwrap().fields().len(), 3);
    }

    #[test]
    fn acknowledged_patch_on_missing_document_becomes_unknown() {
        let mut document = Document::new_invalid(key());
        let patch = Mutation::patch(key(), map(&[("x", 1.into())]), FieldMask::new([path("x")]));
        patch.apply_to_remote_document(
            &mut document,
            &MutationResult { version: version(7), transform_results: Vec::new() },
        );
        assert!(document.is_unknown_document());
        assert_eq!(document.version(), version(7));
    }

    #[test]
    fn acknowledged_set_uses_server_transform_results() {
        let mut document = Document::new_invalid(key());
        let set = Mutation::set(key(), MapValue::empty())
            .with_transform(path("at"), TransformOperation::ServerTimestamp);
        let server_time = FirestoreValue::from_timestamp(Timestamp::new(100, 0));
        set.apply_to_remote_document(
            &mut document,
            &MutationResult { version: version(100), transform_results: vec![server_time.clone()] },
        );
        assert!(document.has_committed_mutations());
        assert_eq!(document.field(&path("at")), Some(&server_time));
    }

    #[test]
    fn overlay_for_partial_mask_is_a_patch() {
        let mut document = Document::new_found(key(), version(1), map(&[("a", 1.into()), ("b", 2.into())]));
        let patch = Mutation::patch(key(), map(&[("a", 3.into())]), FieldMask::new([path("a"), path("c.d")]));
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::new(2, 0));
        let overlay = calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        match overlay.kind {
            MutationKind::Patch { value, mask } => {
                assert_eq!(value.fields(), map(&[("a", 3.into())]).fields());
                let fields: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
                assert_eq!(fields, vec!["a".to_string(), "c".to_string()]);
            }
            other => panic!("unexpected overlay {other:?}"),
        }
        assert!(overlay.precondition.is_none());
    }

    #[test]
    fn overlay_for_deleted_document_is_a_delete() {
        let mut document = Document::new_found(key(), version(1), MapValue::new(BTreeMap::new()));
        let mask = Mutation::delete(key()).apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::new(2, 0));
        let overlay = calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        assert_eq!(overlay.kind, MutationKind::Delete);
    }
}
