use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::Target;
use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::schema::{
    DbDocumentOverlay, DbMutationBatch, DbRemoteDocument, DbRemoteDocumentKind, DbTarget,
};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, DocumentState, DocumentType, MutationBatch, Overlay,
};
use crate::firestore::remote::JsonProtoSerializer;

/// Converts model objects to the rows stored by the local tables.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &JsonProtoSerializer {
        &self.remote
    }

    pub fn encode_remote_document(&self, document: &Document) -> DbRemoteDocument {
        let kind = match document.document_type() {
            DocumentType::FoundDocument => DbRemoteDocumentKind::Found,
            DocumentType::NoDocument => DbRemoteDocumentKind::NoDocument,
            DocumentType::UnknownDocument | DocumentType::Invalid => DbRemoteDocumentKind::Unknown,
        };
        let fields = document
            .is_found_document()
            .then(|| self.remote.encode_fields(document.data()));
        DbRemoteDocument {
            path: document.key().path().clone(),
            kind,
            version: document.version(),
            read_time: document.read_time(),
            create_time: document.create_time(),
            has_committed_mutations: document.has_committed_mutations(),
            fields,
        }
    }

    pub fn decode_remote_document(&self, row: &DbRemoteDocument) -> FirestoreResult<Document> {
        let key = DocumentKey::from_path(row.path.clone())?;
        let mut document = match row.kind {
            DbRemoteDocumentKind::Found => {
                let data = self.remote.decode_fields(row.fields.as_ref())?;
                Document::new_found(key, row.version, data)
            }
            DbRemoteDocumentKind::NoDocument => Document::new_no_document(key, row.version),
            DbRemoteDocumentKind::Unknown => Document::new_unknown(key, row.version),
        };
        if row.has_committed_mutations && document.state() != DocumentState::HasCommittedMutations {
            document.set_has_committed_mutations();
        }
        document.set_read_time(row.read_time);
        document.set_create_time(row.create_time);
        Ok(document)
    }

    /// Approximate on-disk size of a cached document, used for the cache
    /// size accounting that drives garbage collection.
    pub fn document_size(&self, row: &DbRemoteDocument) -> i64 {
        serde_json::to_vec(row).map(|bytes| bytes.len() as i64).unwrap_or(0)
    }

    pub fn encode_mutation_batch(&self, user_id: &str, batch: &MutationBatch) -> DbMutationBatch {
        DbMutationBatch {
            user_id: user_id.to_string(),
            batch_id: batch.batch_id,
            local_write_time: batch.local_write_time,
            base_mutations: batch
                .base_mutations
                .iter()
                .map(|m| self.remote.encode_mutation(m))
                .collect(),
            mutations: batch
                .mutations
                .iter()
                .map(|m| self.remote.encode_mutation(m))
                .collect(),
        }
    }

    pub fn decode_mutation_batch(&self, row: &DbMutationBatch) -> FirestoreResult<MutationBatch> {
        let decode_all = |values: &[JsonValue]| {
            values
                .iter()
                .map(|value| self.remote.decode_mutation(value))
                .collect::<FirestoreResult<Vec<_>>>()
        };
        Ok(MutationBatch::new(
            row.batch_id,
            row.local_write_time,
            decode_all(&row.base_mutations)?,
            decode_all(&row.mutations)?,
        ))
    }

    pub fn encode_target_data(&self, target_data: &TargetData) -> DbTarget {
        DbTarget {
            target_id: target_data.target_id,
            canonical_id: target_data.target.canonical_id(),
            read_time: target_data.snapshot_version,
            resume_token: BASE64_STANDARD.encode(&target_data.resume_token),
            last_listen_sequence_number: target_data.sequence_number,
            last_limbo_free_snapshot_version: target_data.last_limbo_free_snapshot_version,
            query: self.encode_target(&target_data.target),
        }
    }

    pub fn decode_target_data(&self, row: &DbTarget) -> FirestoreResult<TargetData> {
        let target = self.decode_target(&row.query)?;
        let resume_token = BASE64_STANDARD
            .decode(&row.resume_token)
            .map_err(|err| data_loss(format!("Invalid resume token for target {}: {err}", row.target_id)))?;
        Ok(TargetData::new(
            target,
            row.target_id,
            TargetPurpose::Listen,
            row.last_listen_sequence_number,
        )
        .with_resume_token(resume_token, row.read_time)
        .with_last_limbo_free_snapshot_version(row.last_limbo_free_snapshot_version))
    }

    pub fn encode_target(&self, target: &Target) -> JsonValue {
        if target.is_document_query() {
            json!({ "documents": [self.remote.resource_name(target.path())] })
        } else {
            json!({ "query": self.remote.encode_query_target(target) })
        }
    }

    pub fn decode_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        if let Some(name) = value
            .get("documents")
            .and_then(JsonValue::as_array)
            .and_then(|documents| documents.first())
            .and_then(JsonValue::as_str)
        {
            let key = self.remote.document_key_from_name(name)?;
            return Ok(Target::for_document(&key));
        }
        match value.get("query") {
            Some(query) => self.remote.decode_query_target(query),
            None => Err(data_loss("Persisted target has neither documents nor query")),
        }
    }

    pub fn encode_overlay(&self, overlay: &Overlay) -> DbDocumentOverlay {
        DbDocumentOverlay {
            largest_batch_id: overlay.largest_batch_id,
            collection_group: overlay.key().collection_group().to_string(),
            overlay_mutation: self.remote.encode_mutation(&overlay.mutation),
        }
    }

    pub fn decode_overlay(&self, row: &DbDocumentOverlay) -> FirestoreResult<Overlay> {
        Ok(Overlay::new(
            row.largest_batch_id,
            self.remote.decode_mutation(&row.overlay_mutation)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::model::{DatabaseId, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")))
    }

    #[test]
    fn committed_documents_keep_their_state() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let mut data = MapValue::empty();
        data.set(
            &crate::firestore::model::FieldPath::from_dot_separated("n").unwrap(),
            FirestoreValue::from_integer(1),
        );
        let version = SnapshotVersion::from_timestamp(Timestamp::new(3, 0));
        let mut document = Document::new_found(key, version, data);
        document.set_has_committed_mutations();
        document.set_read_time(version);

        let row = serializer.encode_remote_document(&document);
        assert!(serializer.document_size(&row) > 0);
        let decoded = serializer.decode_remote_document(&row).unwrap();
        assert_eq!(decoded, document);
    }

    #[test]
    fn limbo_targets_persist_as_document_targets() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        let data = TargetData::new(Target::for_document(&key), 3, TargetPurpose::LimboResolution, 9);
        let row = serializer.encode_target_data(&data);
        assert_eq!(row.canonical_id, "rooms/eros|f:|ob:");
        let decoded = serializer.decode_target_data(&row).unwrap();
        assert_eq!(decoded.target, data.target);
        assert_eq!(decoded.sequence_number, 9);

        let query_target = Query::collection("rooms").unwrap().to_target();
        let row = serializer.encode_target_data(&TargetData::new(query_target.clone(), 2, TargetPurpose::Listen, 1));
        assert_eq!(serializer.decode_target_data(&row).unwrap().target.canonical_id(), query_target.canonical_id());
    }
}
