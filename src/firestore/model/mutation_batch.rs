use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::mutation::{calculate_overlay_mutation, FieldMask, Mutation, MutationResult};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, OverlayedDocument, SnapshotVersion, Timestamp,
};

/// Mutations written together by one user operation.
///
/// `base_mutations` are applied before `mutations` when computing local
/// views; they pin the inputs of non-idempotent transforms and are never
/// sent to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies the acknowledged mutations for `document`'s key.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if &mutation.key == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies every mutation for `document`'s key as a pending write.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if &mutation.key == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies this batch to a set of overlayed documents and returns the
    /// squashed overlay mutation for each touched key.
    ///
    /// Keys in `documents_without_remote_version` get whole-document
    /// overlays, since a patch cannot be replayed on a base that may not
    /// exist remotely.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mut mask =
                self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            if documents_without_remote_version.contains(&key) {
                mask = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mask;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// A batch paired with the server's per-mutation results.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    /// Pairs `results` with the batch. The server must return exactly one
    /// result per mutation.
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key.clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
