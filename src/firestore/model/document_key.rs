use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Path of a single document. Keys order like their paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document key {path}: document paths need an even number of segments"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// The key with an empty path. Sorts before every real key and is used
    /// as the lower bound of index offsets.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.parent()
    }

    /// Id of the collection that directly contains the document.
    pub fn collection_group(&self) -> &str {
        self.path
            .segment(self.path.len().saturating_sub(2))
            .unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.path.len() >= 2 && self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn exposes_collection_information() {
        let key = DocumentKey::from_string("cities/sf/landmarks/bridge").unwrap();
        assert_eq!(key.id(), "bridge");
        assert_eq!(key.collection_group(), "landmarks");
        assert!(key.has_collection_id("landmarks"));
        assert_eq!(key.collection_path().canonical_string(), "cities/sf/landmarks");
        assert!(DocumentKey::empty() < key);
    }
}
