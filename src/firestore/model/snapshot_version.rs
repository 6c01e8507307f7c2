use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Version of a document or a consistent watch snapshot as assigned by the
/// backend. [`SnapshotVersion::min`] marks "no version known".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn from_timestamp(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self::from_timestamp(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self::from_timestamp(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}
