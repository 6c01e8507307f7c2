mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_path;
mod geo_point;
pub mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType};
pub use document_key::DocumentKey;
pub use field_index::{
    FieldIndex, IndexKind, IndexOffset, IndexSegment, IndexState, INITIAL_LARGEST_BATCH_ID,
    INITIAL_SEQUENCE_NUMBER, UNKNOWN_INDEX_ID,
};
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind,
    MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

pub type BatchId = i32;
pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Batch id used before any batch has been read from the queue.
pub const BATCH_ID_UNKNOWN: BatchId = -1;
