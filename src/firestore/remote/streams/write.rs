use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value as JsonValue};

use crate::firestore::credentials::CredentialsProvider;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::connection::{Connection, WRITE_RPC};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{PersistentStream, StreamHandler, StreamTimers};
use crate::firestore::settings::StreamSettings;
use crate::util::{AsyncQueue, TimerId};

pub trait WriteStreamListener: Send + Sync + 'static {
    fn on_write_stream_open(&self) -> FirestoreResult<()>;

    /// The backend answered the handshake; mutations may be sent now.
    fn on_write_handshake_complete(&self) -> FirestoreResult<()>;

    fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>) -> FirestoreResult<()>;

    fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

struct WriteResponse {
    stream_token: Vec<u8>,
    results: Option<(SnapshotVersion, Vec<MutationResult>)>,
}

/// The `Write` RPC. After opening, the client sends a handshake and waits for
/// the stream token before pipelining mutation batches. Every response
/// carries a new token that the next request must echo.
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WriteStreamListener>,
    state: Mutex<WriteState>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        settings: StreamSettings,
        serializer: JsonProtoSerializer,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<WriteStream>| {
            let handler: Weak<dyn StreamHandler> = weak.clone();
            Self {
                stream: PersistentStream::new(
                    WRITE_RPC,
                    StreamTimers {
                        idle: TimerId::WriteStreamIdle,
                        backoff: TimerId::WriteStreamConnectionBackoff,
                    },
                    settings,
                    queue,
                    connection,
                    credentials,
                    handler,
                ),
                serializer,
                listener,
                state: Mutex::new(WriteState::default()),
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

    pub fn handshake_complete(&self) -> bool {
        self.state().handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.state().last_stream_token.clone()
    }

    /// Seeds the token persisted by a previous session.
    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.state().last_stream_token = token;
    }

    pub fn write_handshake(&self) -> FirestoreResult<()> {
        if self.handshake_complete() {
            return Err(internal_error("Handshake already completed"));
        }
        self.stream.send(json!({ "database": self.serializer.database_name() }))
    }

    pub fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let token = {
            let state = self.state();
            if !state.handshake_complete {
                return Err(internal_error("Handshake must complete before writing mutations"));
            }
            state.last_stream_token.clone()
        };
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        self.stream.send(json!({
            "streamToken": self.serializer.encode_bytes(&token),
            "writes": writes,
        }))
    }

    /// Decodes a whole response before any of it is applied. Handshake
    /// replies carry only the stream token.
    fn decode_response(&self, message: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = self.serializer.decode_bytes(message.get("streamToken"))?;
        if !self.handshake_complete() {
            return Ok(WriteResponse {
                stream_token,
                results: None,
            });
        }
        let commit_version = self.serializer.decode_version(message.get("commitTime"))?;
        let results = self
            .serializer
            .decode_write_results(message.get("writeResults"), commit_version)?;
        Ok(WriteResponse {
            stream_token,
            results: Some((commit_version, results)),
        })
    }

    fn state(&self) -> MutexGuard<'_, WriteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Arc<dyn WriteStreamListener>> {
        self.listener.upgrade()
    }
}

impl StreamHandler for WriteStream {
    fn on_open(&self) -> FirestoreResult<()> {
        self.state().handshake_complete = false;
        match self.listener() {
            Some(listener) => listener.on_write_stream_open(),
            None => Ok(()),
        }
    }

    fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let response = match self.decode_response(&message) {
            Ok(response) => response,
            Err(err) => return self.stream.fail_with_malformed_response(err),
        };
        {
            let mut state = self.state();
            state.last_stream_token = response.stream_token;
            state.handshake_complete = true;
        }
        let Some(listener) = self.listener() else {
            return Ok(());
        };
        match response.results {
            None => listener.on_write_handshake_complete(),
            Some((commit_version, results)) => {
                // A successful response proves the connection works again.
                self.stream.reset_backoff();
                listener.on_mutation_result(commit_version, results)
            }
        }
    }

    fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener() {
            Some(listener) => listener.on_write_stream_close(error),
            None => Ok(()),
        }
    }
}
