use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Placeholder for a key with no known state.
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document exists but its contents are unknown, e.g. after a patch
    /// was acknowledged for a document that was never fetched.
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as seen by the local engine: either cached server state or a
/// transient local view with pending writes applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::min(),
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data: MapValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_found(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_unknown(version);
        document
    }

    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(
                self.document_type,
                DocumentType::NoDocument | DocumentType::Invalid
            )
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Marks the document as carrying unacknowledged writes. Such documents
    /// never have a confirmed version.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: SnapshotVersion) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    #[test]
    fn local_mutations_clear_the_version() {
        let key = DocumentKey::from_string("docs/a").unwrap();
        let mut document = Document::new_found(key, version(5), MapValue::empty());
        assert_eq!(document.version(), version(5));
        document.set_has_local_mutations();
        assert!(document.has_local_mutations());
        assert!(document.version().is_min());
    }

    #[test]
    fn tracks_document_type_transitions() {
        let key = DocumentKey::from_string("docs/a").unwrap();
        let mut document = Document::new_invalid(key);
        assert!(!document.is_valid_document());
        document.convert_to_no_document(version(1));
        assert!(document.is_no_document());
        document.convert_to_found(version(2), MapValue::empty());
        assert!(document.is_found_document());
        assert_eq!(document.create_time(), version(2));
        document.convert_to_unknown(version(3));
        assert!(document.is_unknown_document());
        assert!(document.has_committed_mutations());
    }
}
