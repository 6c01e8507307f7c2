use std::collections::BTreeSet;

use crate::firestore::core::OnlineState;
use crate::firestore::credentials::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks from the remote store into the sync engine.
///
/// Calls arrive on the async queue while the remote store holds none of its
/// own locks, except [`get_remote_keys_for_target`](Self::get_remote_keys_for_target),
/// which must not call back into the remote store.
pub trait RemoteSyncer: Send + Sync + 'static {
    fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed `target_id` with an error.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected `batch_id`.
    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Runs while both streams are stopped for the user switch.
    fn handle_credential_change(&self, user: &User) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState);
}
