//! Decoded `ListenResponse` messages.

use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, map_grpc_status, FirestoreError, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;

#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    Target(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document was added to, changed in, or removed from some targets.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// The new state of the document: found for changes, a deleted
    /// document for deletes, `None` when it merely left a target.
    pub new_document: Option<Document>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub cause: Option<FirestoreError>,
}

/// Bloom filter over the names of the documents that did not change,
/// as sent by the backend. The bitmap stays base64 until it is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: String,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

/// Decodes one `ListenResponse`.
pub fn decode_watch_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    if let Some(change) = value.get("targetChange") {
        return decode_target_change(serializer, change);
    }
    if let Some(change) = value.get("documentChange") {
        let document = change
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange is missing its document"))?;
        let document = serializer.decode_document(document)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: target_ids(change.get("targetIds")),
            removed_target_ids: target_ids(change.get("removedTargetIds")),
            key: document.key().clone(),
            new_document: Some(document),
        }));
    }
    if let Some(change) = value.get("documentDelete") {
        let key = document_key(serializer, change)?;
        let version = serializer.decode_version(change.get("readTime"))?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids(change.get("removedTargetIds")),
            new_document: Some(Document::new_no_document(key.clone(), version)),
            key,
        }));
    }
    if let Some(change) = value.get("documentRemove") {
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids(change.get("removedTargetIds")),
            key: document_key(serializer, change)?,
            new_document: None,
        }));
    }
    if let Some(filter) = value.get("filter") {
        return Ok(WatchChange::ExistenceFilter(decode_filter(filter)));
    }
    Err(invalid_argument(format!("Unknown listen response: {value}")))
}

/// Snapshot version a response completes. Only global target changes (no
/// target ids) carry a consistent read time.
pub fn snapshot_version_of(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
    let Some(change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !target_ids(change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    serializer.decode_version(change.get("readTime"))
}

fn decode_target_change(serializer: &JsonProtoSerializer, change: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = match change.get("targetChangeType").and_then(JsonValue::as_str) {
        None | Some("NO_CHANGE") => WatchTargetChangeState::NoChange,
        Some("ADD") => WatchTargetChangeState::Added,
        Some("REMOVE") => WatchTargetChangeState::Removed,
        Some("CURRENT") => WatchTargetChangeState::Current,
        Some("RESET") => WatchTargetChangeState::Reset,
        Some(other) => return Err(invalid_argument(format!("Unknown target change type {other}"))),
    };
    let cause = change.get("cause").map(|cause| {
        let code = cause.get("code").and_then(JsonValue::as_i64).unwrap_or(2) as i32;
        let message = cause
            .get("message")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        map_grpc_status(code, message)
    });
    Ok(WatchChange::Target(WatchTargetChange {
        state,
        target_ids: target_ids(change.get("targetIds")),
        resume_token: serializer.decode_bytes(change.get("resumeToken"))?,
        cause,
    }))
}

fn decode_filter(filter: &JsonValue) -> ExistenceFilterChange {
    let unchanged_names = filter.get("unchangedNames").and_then(|names| {
        let bits = names.get("bits")?;
        Some(BloomFilterParams {
            bitmap: bits
                .get("bitmap")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            padding: bits.get("padding").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
            hash_count: names.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
        })
    });
    ExistenceFilterChange {
        target_id: filter.get("targetId").and_then(JsonValue::as_i64).unwrap_or(0) as TargetId,
        count: filter.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
        unchanged_names,
    }
}

fn document_key(serializer: &JsonProtoSerializer, change: &JsonValue) -> FirestoreResult<DocumentKey> {
    let name = change
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Document change is missing the document name"))?;
    serializer.document_key_from_name(name)
}

fn target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(JsonValue::as_i64)
                .map(|id| id as TargetId)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("p"))
    }

    #[test]
    fn decodes_target_changes_with_causes() {
        let change = decode_watch_change(
            &serializer(),
            &json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            }}),
        )
        .unwrap();
        let WatchChange::Target(change) = change else {
            panic!("expected a target change");
        };
        assert_eq!(change.state, WatchTargetChangeState::Removed);
        assert_eq!(change.target_ids, vec![2]);
        assert_eq!(change.cause.unwrap().code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn deletes_carry_a_deleted_document() {
        let change = decode_watch_change(
            &serializer(),
            &json!({ "documentDelete": {
                "document": "projects/p/databases/(default)/documents/rooms/eros",
                "readTime": "1970-01-01T00:00:05Z",
                "removedTargetIds": [2]
            }}),
        )
        .unwrap();
        let WatchChange::Document(change) = change else {
            panic!("expected a document change");
        };
        assert!(change.new_document.unwrap().is_no_document());
        assert_eq!(change.removed_target_ids, vec![2]);
    }

    #[test]
    fn only_global_target_changes_complete_a_snapshot() {
        let global = json!({ "targetChange": { "readTime": "1970-01-01T00:00:05Z" } });
        let scoped = json!({ "targetChange": { "targetIds": [2], "readTime": "1970-01-01T00:00:05Z" } });
        assert!(!snapshot_version_of(&serializer(), &global).unwrap().is_min());
        assert!(snapshot_version_of(&serializer(), &scoped).unwrap().is_min());
    }

    #[test]
    fn filters_keep_their_bloom_filter() {
        let change = decode_watch_change(
            &serializer(),
            &json!({ "filter": {
                "targetId": 4,
                "count": 1,
                "unchangedNames": { "bits": { "bitmap": "AQ==", "padding": 3 }, "hashCount": 2 }
            }}),
        )
        .unwrap();
        let WatchChange::ExistenceFilter(filter) = change else {
            panic!("expected an existence filter");
        };
        assert_eq!(filter.target_id, 4);
        assert_eq!(
            filter.unchanged_names,
            Some(BloomFilterParams {
                bitmap: "AQ==".into(),
                padding: 3,
                hash_count: 2
            })
        );
    }
}
