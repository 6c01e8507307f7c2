use crate::firestore::core::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A user query.
    Listen,
    /// Re-listen after an existence filter mismatch without a bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter could not resolve a mismatch.
    ExistenceFilterMismatchBloom,
    /// Single document target that resolves a limbo document.
    LimboResolution,
}

/// Everything the client tracks about an active or cached target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    /// Sequence number of the last transaction that used the target.
    pub sequence_number: ListenSequenceNumber,
    /// Version of the latest snapshot received for the target.
    pub snapshot_version: SnapshotVersion,
    /// Last version at which the target's results had no limbo documents.
    /// Queries may resume from their cached results at this version.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the client believes match, sent with a resumed
    /// listen so the backend can answer with an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// A new resume token invalidates any expected count.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}
