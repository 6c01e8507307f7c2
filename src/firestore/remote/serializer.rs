//! JSON encoding of the backend's proto3 messages.
//!
//! Values, documents, writes, structured queries and listen targets are
//! converted to and from the JSON mapping of the Firestore protos. The same
//! encoding is reused by the local serializer for persisted records.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};

use crate::firestore::core::{
    Bound, CompositeOperator, Direction, FieldFilter, Filter, Operator, OrderBy, Target,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::mutation::{
    FieldMask, FieldTransform, Mutation, MutationKind, MutationResult, Precondition,
    TransformOperation,
};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldPath, GeoPoint, ResourcePath, SnapshotVersion,
    Timestamp,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Parses a fully qualified resource name of this database into a
    /// database-relative path.
    pub fn resource_path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        let relative = if name == root {
            ""
        } else if let Some(rest) = name.strip_prefix(&format!("{root}/")) {
            rest
        } else {
            return Err(invalid_argument(format!(
                "Tried to deserialize resource {name} outside of database {}",
                self.database_name()
            )));
        };
        ResourcePath::from_string(relative)
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.resource_path_from_name(name)?)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Reference(reference) if !reference.starts_with("projects/") => {
                json!({ "referenceValue": format!("{}/{reference}", self.documents_root()) })
            }
            ValueKind::Array(array) => {
                let values: Vec<JsonValue> =
                    array.values().iter().map(|v| self.encode_value(v)).collect();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({ "mapValue": { "fields": self.encode_fields(map) } }),
            _ => encode_value(value),
        }
    }

    /// References into this database decode to their database-relative
    /// form, matching how the client builds them.
    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value, &self.documents_root())
    }

    pub fn encode_fields(&self, map: &MapValue) -> JsonValue {
        let fields: Map<String, JsonValue> = map
            .fields()
            .iter()
            .map(|(key, value)| (key.clone(), self.encode_value(value)))
            .collect();
        JsonValue::Object(fields)
    }

    pub fn decode_fields(&self, fields: Option<&JsonValue>) -> FirestoreResult<MapValue> {
        let Some(fields) = fields else {
            return Ok(MapValue::empty());
        };
        let object = fields
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
        let mut decoded = BTreeMap::new();
        for (key, value) in object {
            decoded.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(decoded))
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> JsonValue {
        JsonValue::String(timestamp.to_rfc3339())
    }

    pub fn encode_version(&self, version: &SnapshotVersion) -> JsonValue {
        self.encode_timestamp(&version.timestamp())
    }

    /// Absent versions decode to [`SnapshotVersion::min`].
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value {
            None | Some(JsonValue::Null) => Ok(SnapshotVersion::min()),
            Some(JsonValue::String(text)) => parse_timestamp(text).map(SnapshotVersion::from_timestamp),
            Some(_) => Err(invalid_argument("Timestamps must be RFC 3339 strings")),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> JsonValue {
        JsonValue::String(BASE64_STANDARD.encode(bytes))
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => BASE64_STANDARD
                .decode(text)
                .map_err(|err| invalid_argument(format!("Invalid base64 bytes: {err}"))),
            None => Ok(Vec::new()),
        }
    }

    /// `Document` message for a found document.
    pub fn encode_document(&self, document: &Document) -> JsonValue {
        let mut encoded = Map::new();
        encoded.insert("name".into(), json!(self.document_name(document.key())));
        encoded.insert("fields".into(), self.encode_fields(document.data()));
        encoded.insert("updateTime".into(), self.encode_version(&document.version()));
        if !document.create_time().is_min() {
            encoded.insert("createTime".into(), self.encode_version(&document.create_time()));
        }
        JsonValue::Object(encoded)
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self.decode_version(value.get("updateTime"))?;
        let data = self.decode_fields(value.get("fields"))?;
        let mut document = Document::new_found(key, version, data);
        document.set_create_time(self.decode_version(value.get("createTime"))?);
        Ok(document)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = Map::new();
        let name = self.document_name(&mutation.key);
        match &mutation.kind {
            MutationKind::Set { value } => {
                write.insert("update".into(), json!({ "name": name, "fields": self.encode_fields(value) }));
            }
            MutationKind::Patch { value, mask } => {
                write.insert("update".into(), json!({ "name": name, "fields": self.encode_fields(value) }));
                let paths: Vec<String> = mask.fields().iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), json!(name));
            }
        }
        if !mutation.field_transforms.is_empty() {
            let transforms: Vec<JsonValue> = mutation
                .field_transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(&mutation.precondition) {
            write.insert("currentDocument".into(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = self.decode_precondition(value.get("currentDocument"))?;
        let field_transforms = match value.get("updateTransforms").and_then(JsonValue::as_array) {
            Some(transforms) => transforms
                .iter()
                .map(|transform| self.decode_field_transform(transform))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let kind_and_key = if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Update write is missing a document name"))?;
            let key = self.document_key_from_name(name)?;
            let fields = self.decode_fields(update.get("fields"))?;
            let kind = match value.get("updateMask") {
                Some(mask) => {
                    let paths = mask
                        .get("fieldPaths")
                        .and_then(JsonValue::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .map(FieldPath::from_server_format)
                        .collect::<FirestoreResult<Vec<_>>>()?;
                    MutationKind::Patch {
                        value: fields,
                        mask: FieldMask::new(paths),
                    }
                }
                None => MutationKind::Set { value: fields },
            };
            (kind, key)
        } else if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            (MutationKind::Delete, self.document_key_from_name(name)?)
        } else if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            (MutationKind::Verify, self.document_key_from_name(name)?)
        } else {
            return Err(invalid_argument("Unknown write operation"));
        };
        let (kind, key) = kind_and_key;
        Ok(Mutation {
            key,
            kind,
            precondition,
            field_transforms,
        })
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(version) }))
            }
        }
    }

    fn decode_precondition(&self, value: Option<&JsonValue>) -> FirestoreResult<Precondition> {
        let Some(value) = value else {
            return Ok(Precondition::None);
        };
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if value.get("updateTime").is_some() {
            return Ok(Precondition::UpdateTime(
                self.decode_version(value.get("updateTime"))?,
            ));
        }
        Ok(Precondition::None)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        let encode_all = |elements: &[FirestoreValue]| -> Vec<JsonValue> {
            elements.iter().map(|value| self.encode_value(value)).collect()
        };
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": { "values": encode_all(elements) }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": { "values": encode_all(elements) }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform is missing fieldPath"))?;
        let field = FieldPath::from_server_format(field)?;
        let decode_all = |values: &JsonValue| -> FirestoreResult<Vec<FirestoreValue>> {
            values
                .get("values")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|value| self.decode_value(value))
                .collect()
        };
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(values) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_all(values)?)
        } else if let Some(values) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_all(values)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(self.decode_value(operand)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field, operation))
    }

    /// Pairs each write result with its mutation. A result without an update
    /// time (e.g. for a verify) takes the commit time.
    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_time: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(results) = results.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        results
            .iter()
            .map(|result| {
                let update_time = self.decode_version(result.get("updateTime"))?;
                let version = if update_time.is_min() {
                    commit_time
                } else {
                    update_time
                };
                let transform_results = result
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .map(|value| self.decode_value(value))
                    .collect::<FirestoreResult<Vec<_>>>()?;
                Ok(MutationResult {
                    version,
                    transform_results,
                })
            })
            .collect()
    }

    /// `Target` message of a listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let mut encoded = Map::new();
        encoded.insert("targetId".into(), json!(target_data.target_id));
        let target = &target_data.target;
        if target.is_document_query() {
            let name = self.resource_name(target.path());
            encoded.insert("documents".into(), json!({ "documents": [name] }));
        } else {
            encoded.insert("query".into(), self.encode_query_target(target));
        }
        if !target_data.resume_token.is_empty() {
            encoded.insert("resumeToken".into(), self.encode_bytes(&target_data.resume_token));
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert("readTime".into(), self.encode_version(&target_data.snapshot_version));
        } else {
            return JsonValue::Object(encoded);
        }
        if let Some(expected_count) = target_data.expected_count {
            encoded.insert("expectedCount".into(), json!(expected_count));
        }
        JsonValue::Object(encoded)
    }

    /// Labels attached to listen requests so the backend can tell
    /// re-listens apart from regular listens.
    pub fn encode_listen_request_labels(&self, purpose: TargetPurpose) -> Option<JsonValue> {
        let tag = match purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        Some(json!({ "goog-listen-tags": tag }))
    }

    /// `QueryTarget` message: parent resource plus structured query.
    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = Map::new();
        let parent = match target.collection_group() {
            Some(group) => {
                structured.insert(
                    "from".into(),
                    json!([{ "collectionId": group, "allDescendants": true }]),
                );
                target.path().clone()
            }
            None => {
                let collection_id = target.path().last_segment().unwrap_or_default();
                structured.insert("from".into(), json!([{ "collectionId": collection_id }]));
                target.path().parent()
            }
        };
        if let Some(filter) = self.encode_filters(target.filters()) {
            structured.insert("where".into(), filter);
        }
        if !target.order_by().is_empty() {
            let orders: Vec<JsonValue> = target
                .order_by()
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field.canonical_string() },
                        "direction": match order.direction {
                            Direction::Ascending => "ASCENDING",
                            Direction::Descending => "DESCENDING",
                        }
                    })
                })
                .collect();
            structured.insert("orderBy".into(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit() {
            structured.insert("limit".into(), json!(limit));
        }
        if let Some(start) = target.start_at() {
            structured.insert("startAt".into(), self.encode_cursor(start, start.inclusive));
        }
        if let Some(end) = target.end_at() {
            structured.insert("endAt".into(), self.encode_cursor(end, !end.inclusive));
        }
        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    pub fn decode_query_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Query target is missing its parent"))?;
        let parent = self.resource_path_from_name(parent)?;
        let query = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("Query target is missing structuredQuery"))?;
        let from = query
            .get("from")
            .and_then(JsonValue::as_array)
            .and_then(|from| from.first())
            .ok_or_else(|| invalid_argument("Structured query needs exactly one collection"))?;
        let collection_id = from
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let all_descendants = from
            .get("allDescendants")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let (path, collection_group) = if all_descendants {
            (parent, Some(collection_id))
        } else {
            (parent.child(collection_id), None)
        };

        let filters = match query.get("where") {
            Some(filter) => match self.decode_filter(filter)? {
                Filter::Composite(composite) if composite.op == CompositeOperator::And => {
                    composite.filters
                }
                other => vec![other],
            },
            None => Vec::new(),
        };
        let order_by = query
            .get("orderBy")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|order| {
                let field = order
                    .get("field")
                    .and_then(|field| field.get("fieldPath"))
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid_argument("orderBy is missing its field"))?;
                let direction = match order.get("direction").and_then(JsonValue::as_str) {
                    Some("DESCENDING") => Direction::Descending,
                    _ => Direction::Ascending,
                };
                Ok(OrderBy::new(FieldPath::from_server_format(field)?, direction))
            })
            .collect::<FirestoreResult<Vec<_>>>()?;
        let limit = query
            .get("limit")
            .and_then(|limit| limit.as_u64().or_else(|| limit.get("value").and_then(JsonValue::as_u64)))
            .map(|limit| limit as u32);
        let start_at = match query.get("startAt") {
            Some(cursor) => {
                let (values, before) = self.decode_cursor(cursor)?;
                Some(Bound::new(values, before))
            }
            None => None,
        };
        let end_at = match query.get("endAt") {
            Some(cursor) => {
                let (values, before) = self.decode_cursor(cursor)?;
                Some(Bound::new(values, !before))
            }
            None => None,
        };
        Ok(Target::new(
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        ))
    }

    fn encode_cursor(&self, bound: &Bound, before: bool) -> JsonValue {
        let values: Vec<JsonValue> = bound.position.iter().map(|v| self.encode_value(v)).collect();
        json!({ "values": values, "before": before })
    }

    fn decode_cursor(&self, value: &JsonValue) -> FirestoreResult<(Vec<FirestoreValue>, bool)> {
        let values = value
            .get("values")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|value| self.decode_value(value))
            .collect::<FirestoreResult<Vec<_>>>()?;
        let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
        Ok((values, before))
    }

    fn encode_filters(&self, filters: &[Filter]) -> Option<JsonValue> {
        match filters {
            [] => None,
            [single] => Some(self.encode_filter(single)),
            many => Some(json!({
                "compositeFilter": {
                    "op": "AND",
                    "filters": many.iter().map(|f| self.encode_filter(f)).collect::<Vec<_>>()
                }
            })),
        }
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field_filter) => self.encode_field_filter(field_filter),
            Filter::Composite(composite) => json!({
                "compositeFilter": {
                    "op": match composite.op {
                        CompositeOperator::And => "AND",
                        CompositeOperator::Or => "OR",
                    },
                    "filters": composite.filters.iter().map(|f| self.encode_filter(f)).collect::<Vec<_>>()
                }
            }),
        }
    }

    fn encode_field_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field.canonical_string() });
        let unary = match (filter.op, filter.value.is_null(), filter.value.is_nan()) {
            (Operator::Equal, true, _) => Some("IS_NULL"),
            (Operator::Equal, _, true) => Some("IS_NAN"),
            (Operator::NotEqual, true, _) => Some("IS_NOT_NULL"),
            (Operator::NotEqual, _, true) => Some("IS_NOT_NAN"),
            _ => None,
        };
        match unary {
            Some(op) => json!({ "unaryFilter": { "op": op, "field": field } }),
            None => json!({
                "fieldFilter": {
                    "field": field,
                    "op": filter.op.wire_name(),
                    "value": self.encode_value(&filter.value),
                }
            }),
        }
    }

    fn decode_filter(&self, value: &JsonValue) -> FirestoreResult<Filter> {
        let field_of = |filter: &JsonValue| -> FirestoreResult<FieldPath> {
            let path = filter
                .get("field")
                .and_then(|field| field.get("fieldPath"))
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Filter is missing its field"))?;
            FieldPath::from_server_format(path)
        };
        if let Some(composite) = value.get("compositeFilter") {
            let filters = composite
                .get("filters")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|filter| self.decode_filter(filter))
                .collect::<FirestoreResult<Vec<_>>>()?;
            return Ok(match composite.get("op").and_then(JsonValue::as_str) {
                Some("OR") => Filter::or(filters),
                _ => Filter::and(filters),
            });
        }
        if let Some(unary) = value.get("unaryFilter") {
            let field = field_of(unary)?;
            let (op, operand) = match unary.get("op").and_then(JsonValue::as_str) {
                Some("IS_NULL") => (Operator::Equal, FirestoreValue::null()),
                Some("IS_NAN") => (Operator::Equal, FirestoreValue::from_double(f64::NAN)),
                Some("IS_NOT_NULL") => (Operator::NotEqual, FirestoreValue::null()),
                Some("IS_NOT_NAN") => (Operator::NotEqual, FirestoreValue::from_double(f64::NAN)),
                other => return Err(invalid_argument(format!("Unknown unary filter {other:?}"))),
            };
            return Filter::field(field, op, operand);
        }
        if let Some(field_filter) = value.get("fieldFilter") {
            let field = field_of(field_filter)?;
            let op = field_filter
                .get("op")
                .and_then(JsonValue::as_str)
                .and_then(Operator::from_wire_name)
                .ok_or_else(|| invalid_argument("Unknown field filter operator"))?;
            let operand = field_filter
                .get("value")
                .map(|value| self.decode_value(value))
                .transpose()?
                .unwrap_or_else(FirestoreValue::null);
            return Filter::field(field, op, operand);
        }
        Err(invalid_argument("Unknown filter type"))
    }
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_nan() {
                json!({ "doubleValue": "NaN" })
            } else if double.is_infinite() {
                let text = if *double > 0.0 { "Infinity" } else { "-Infinity" };
                json!({ "doubleValue": text })
            } else {
                json!({ "doubleValue": double })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => {
            json!({ "bytesValue": BASE64_STANDARD.encode(bytes.as_slice()) })
        }
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => {
            let fields: Map<String, JsonValue> = map
                .fields()
                .iter()
                .map(|(key, value)| (key.clone(), encode_value(value)))
                .collect();
            json!({ "mapValue": { "fields": fields } })
        }
    }
}

fn decode_value(value: &JsonValue, documents_root: &str) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::from(decoded)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        let relative = str_value
            .strip_prefix(documents_root)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(str_value);
        return Ok(FirestoreValue::from_reference(relative));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = array_value
            .get("values")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|value| decode_value(value, documents_root))
            .collect::<FirestoreResult<Vec<_>>>()?;
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        let mut fields = BTreeMap::new();
        if let Some(entries) = map_value.get("fields").and_then(JsonValue::as_object) {
            for (key, value) in entries {
                fields.insert(key.clone(), decode_value(value, documents_root)?);
            }
        }
        return Ok(FirestoreValue::from_map(fields));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    #[test]
    fn decodes_documents_by_name() {
        let serializer = serializer();
        let json = json!({
            "name": "projects/project/databases/(default)/documents/rooms/eros",
            "fields": { "age": { "integerValue": "42" }, "nan": { "doubleValue": "NaN" } },
            "updateTime": "2024-01-01T00:00:01Z"
        });
        let document = serializer.decode_document(&json).unwrap();
        assert_eq!(document.key().to_string(), "rooms/eros");
        assert_eq!(document.field(&field("age")), Some(&FirestoreValue::from_integer(42)));
        assert!(document.field(&field("nan")).unwrap().is_nan());
        assert_eq!(document.version().timestamp().seconds, 1_704_067_201);
    }

    #[test]
    fn rejects_names_from_other_databases() {
        let err = serializer()
            .document_key_from_name("projects/other/databases/(default)/documents/a/b")
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn encodes_patch_writes_with_preconditions_and_transforms() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let mut value = MapValue::empty();
        value.set(&field("a"), FirestoreValue::from_integer(1));
        let mutation = Mutation::patch(key, value, FieldMask::new([field("a")]))
            .with_transform(field("t"), TransformOperation::ServerTimestamp);
        let encoded = serializer.encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"]["fieldPaths"], json!(["a"]));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(encoded["updateTransforms"][0]["setToServerValue"], json!("REQUEST_TIME"));
        assert_eq!(serializer.decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn encodes_structured_queries() {
        let serializer = serializer();
        let target = Query::collection("rooms/eros/messages")
            .unwrap()
            .with_filter(Filter::field(field("score"), Operator::GreaterThan, 3i64.into()).unwrap())
            .with_filter(Filter::field(field("flag"), Operator::Equal, FirestoreValue::null()).unwrap())
            .with_limit_to_first(10)
            .to_target();
        let encoded = serializer.encode_query_target(&target);
        assert_eq!(
            encoded["parent"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        let query = &encoded["structuredQuery"];
        assert_eq!(query["from"][0]["collectionId"], json!("messages"));
        assert_eq!(query["where"]["compositeFilter"]["op"], json!("AND"));
        assert_eq!(
            query["where"]["compositeFilter"]["filters"][1]["unaryFilter"]["op"],
            json!("IS_NULL")
        );
        assert_eq!(query["limit"], json!(10));
        let decoded = serializer.decode_query_target(&encoded).unwrap();
        assert_eq!(decoded.canonical_id(), target.canonical_id());
    }

    #[test]
    fn listen_targets_prefer_resume_tokens() {
        let serializer = serializer();
        let target = Query::collection("rooms").unwrap().to_target();
        let mut data = TargetData::new(target, 2, TargetPurpose::Listen, 1);
        data.resume_token = vec![1, 2, 3];
        data.snapshot_version = SnapshotVersion::from_timestamp(Timestamp::new(5, 0));
        data.expected_count = Some(4);
        let encoded = serializer.encode_target(&data);
        assert_eq!(encoded["resumeToken"], json!("AQID"));
        assert!(encoded.get("readTime").is_none());
        assert_eq!(encoded["expectedCount"], json!(4));
    }
}
