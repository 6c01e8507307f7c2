use crate::firestore::model::mutation::{FieldMask, Mutation};
use crate::firestore::model::{BatchId, Document, DocumentKey};

/// The squashed mutation for one document, tagged with the newest batch
/// that contributed to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.mutation.key
    }
}

/// A local view paired with the fields pending writes changed
/// (`None` when the whole document was rewritten).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: Document, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}
