use std::sync::{Arc, Weak};

use serde_json::{json, Value as JsonValue};

use crate::firestore::credentials::CredentialsProvider;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{SnapshotVersion, TargetId};
use crate::firestore::remote::connection::{Connection, LISTEN_RPC};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{PersistentStream, StreamHandler, StreamTimers};
use crate::firestore::remote::watch_change::{decode_watch_change, snapshot_version_of, WatchChange};
use crate::firestore::settings::StreamSettings;
use crate::util::{AsyncQueue, TimerId};

/// Receives decoded watch traffic. All callbacks run on the async queue.
pub trait WatchStreamListener: Send + Sync + 'static {
    fn on_watch_stream_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is non-min only for changes that complete a
    /// consistent snapshot.
    fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()>;

    fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The `Listen` RPC: adds and removes targets and decodes watch changes.
pub struct ListenStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

impl ListenStream {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        settings: StreamSettings,
        serializer: JsonProtoSerializer,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ListenStream>| {
            let handler: Weak<dyn StreamHandler> = weak.clone();
            Self {
                stream: PersistentStream::new(
                    LISTEN_RPC,
                    StreamTimers {
                        idle: TimerId::ListenStreamIdle,
                        backoff: TimerId::ListenStreamConnectionBackoff,
                    },
                    settings,
                    queue,
                    connection,
                    credentials,
                    handler,
                ),
                serializer,
                listener,
            }
        })
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) -> FirestoreResult<()> {
        self.stream.stop()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Registers `target_data` with the backend, resuming from its token or
    /// read time when it has one.
    pub fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let mut request = json!({
            "database": self.serializer.database_name(),
            "addTarget": self.serializer.encode_target(target_data),
        });
        if let Some(labels) = self.serializer.encode_listen_request_labels(target_data.purpose) {
            request["labels"] = labels;
        }
        self.stream.send(request)
    }

    pub fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.stream.send(json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        }))
    }

    fn listener(&self) -> Option<Arc<dyn WatchStreamListener>> {
        self.listener.upgrade()
    }
}

impl StreamHandler for ListenStream {
    fn on_open(&self) -> FirestoreResult<()> {
        match self.listener() {
            Some(listener) => listener.on_watch_stream_open(),
            None => Ok(()),
        }
    }

    fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let decoded = decode_watch_change(&self.serializer, &message)
            .and_then(|change| Ok((change, snapshot_version_of(&self.serializer, &message)?)));
        let (change, snapshot_version) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => return self.stream.fail_with_malformed_response(err),
        };
        self.stream.reset_backoff();
        match self.listener() {
            Some(listener) => listener.on_watch_stream_change(change, snapshot_version),
            None => Ok(()),
        }
    }

    fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener() {
            Some(listener) => listener.on_watch_stream_close(error),
            None => Ok(()),
        }
    }
}
