use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, Document, DocumentKey, FieldPath, ListenSequenceNumber, SnapshotVersion};

pub const UNKNOWN_INDEX_ID: i32 = -1;
pub const INITIAL_SEQUENCE_NUMBER: ListenSequenceNumber = 0;
pub const INITIAL_LARGEST_BATCH_ID: BatchId = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Backfill watermark: every document at or before this offset has been
/// indexed.
///
/// Offsets order by read time, then key, then largest batch id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn new(read_time: SnapshotVersion, document_key: DocumentKey, largest_batch_id: BatchId) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// Offset before every document.
    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), DocumentKey::empty(), INITIAL_LARGEST_BATCH_ID)
    }

    /// Offset just past everything read at or before `read_time`.
    pub fn successor_of_read_time(read_time: SnapshotVersion, largest_batch_id: BatchId) -> Self {
        Self::new(
            SnapshotVersion::from_timestamp(read_time.timestamp().successor()),
            DocumentKey::empty(),
            largest_batch_id,
        )
    }

    pub fn from_document(document: &Document) -> Self {
        Self::new(document.read_time(), document.key().clone(), INITIAL_LARGEST_BATCH_ID)
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub sequence_number: ListenSequenceNumber,
    pub offset: IndexOffset,
}

impl IndexState {
    pub fn new(sequence_number: ListenSequenceNumber, offset: IndexOffset) -> Self {
        Self {
            sequence_number,
            offset,
        }
    }

    pub fn empty() -> Self {
        Self::new(INITIAL_SEQUENCE_NUMBER, IndexOffset::none())
    }
}

/// A client-side index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub index_state: IndexState,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: UNKNOWN_INDEX_ID,
            collection_group: collection_group.into(),
            segments,
            index_state: IndexState::empty(),
        }
    }

    /// The single `Contains` segment, if the index has one.
    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    /// Ordered (non-`Contains`) segments.
    pub fn directional_segments(&self) -> Vec<&IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
            .collect()
    }

    /// Compares definitions, ignoring id and state.
    pub fn semantic_compare(&self, other: &FieldIndex) -> Ordering {
        self.collection_group
            .cmp(&other.collection_group)
            .then_with(|| {
                let left = self.segments.iter().map(|s| (&s.field_path, s.kind));
                let right = other.segments.iter().map(|s| (&s.field_path, s.kind));
                left.cmp(right)
            })
    }
}
