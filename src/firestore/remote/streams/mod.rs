//! Long-lived RPC streams with idle detection and backoff.
//!
//! ```text
//!   Initial --start--> Starting --open--> Open --health check--> Healthy
//!      ^                   |                |                      |
//!      |                   +------error-----+----------------------+--> Error
//!      |                                                                  |
//!      +--------------------------- Backoff <-------------start-----------+
//! ```
//!
//! Every callback runs on the [`AsyncQueue`]. Callbacks that belong to an
//! earlier incarnation of the stream are dropped using a generation counter.

pub mod listen;
pub mod write;

pub use listen::{ListenStream, WatchStreamListener};
pub use write::{WriteStream, WriteStreamListener};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value as JsonValue;

use crate::firestore::credentials::CredentialsProvider;
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::connection::{Connection, DuplexStream};
use crate::firestore::settings::StreamSettings;
use crate::platform::runtime;
use crate::util::{AsyncQueue, DelayedOperation, ExponentialBackoff, TimerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Starting,
    Open,
    /// Open for longer than the health-check delay. Auth failures in this
    /// state do not invalidate the token.
    Healthy,
    Error,
    Backoff,
}

/// Receives the events of a [`PersistentStream`]. Implemented by the
/// protocol-specific stream wrappers.
pub(crate) trait StreamHandler: Send + Sync + 'static {
    fn on_open(&self) -> FirestoreResult<()>;
    fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;
    fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamTimers {
    pub idle: TimerId,
    pub backoff: TimerId,
}

struct StreamCore {
    state: StreamState,
    generation: u64,
    stream: Option<Arc<DuplexStream>>,
    backoff: ExponentialBackoff,
    backoff_op: Option<DelayedOperation>,
    idle_timer: Option<DelayedOperation>,
    health_check: Option<DelayedOperation>,
}

struct StreamInner {
    rpc_name: &'static str,
    timers: StreamTimers,
    settings: StreamSettings,
    queue: AsyncQueue,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    handler: Weak<dyn StreamHandler>,
    core: Mutex<StreamCore>,
}

#[derive(Clone)]
pub(crate) struct PersistentStream {
    inner: Arc<StreamInner>,
}

impl PersistentStream {
    pub(crate) fn new(
        rpc_name: &'static str,
        timers: StreamTimers,
        settings: StreamSettings,
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        handler: Weak<dyn StreamHandler>,
    ) -> Self {
        let backoff = ExponentialBackoff::new(settings.backoff.clone());
        Self {
            inner: Arc::new(StreamInner {
                rpc_name,
                timers,
                settings,
                queue,
                connection,
                credentials,
                handler,
                core: Mutex::new(StreamCore {
                    state: StreamState::Initial,
                    generation: 0,
                    stream: None,
                    backoff,
                    backoff_op: None,
                    idle_timer: None,
                    health_check: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> StreamState {
        self.inner.core().state
    }

    /// Starting, backing off, or open.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Backoff | StreamState::Open | StreamState::Healthy
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), StreamState::Open | StreamState::Healthy)
    }

    /// Opens the stream, or schedules a reopen after a backoff delay when
    /// the previous attempt failed.
    pub fn start(&self) {
        let mut core = self.inner.core();
        match core.state {
            StreamState::Error => {
                self.perform_backoff(&mut core);
                return;
            }
            StreamState::Initial => {}
            other => {
                log::debug!("{} stream start ignored in state {other:?}", self.inner.rpc_name);
                return;
            }
        }
        core.state = StreamState::Starting;
        core.generation += 1;
        let generation = core.generation;
        drop(core);

        let inner = Arc::clone(&self.inner);
        runtime::spawn_detached(async move {
            let opened = match inner.credentials.get_token().await {
                Ok(token) => inner.connection.open_stream(inner.rpc_name, token).await,
                Err(err) => Err(err),
            };
            let queue = inner.queue.clone();
            queue.enqueue_and_forget(move || async move {
                let stream = PersistentStream { inner };
                match opened {
                    Ok(duplex) => stream.on_stream_opened(generation, duplex),
                    Err(err) => stream.on_stream_closed(generation, Some(err)),
                }
            });
        });
    }

    /// Closes the stream without an error. Stopping an idle stream is a no-op.
    pub fn stop(&self) -> FirestoreResult<()> {
        if self.is_started() {
            self.close(StreamState::Initial, None)?;
        }
        Ok(())
    }

    /// Next start goes straight to the connection instead of backing off.
    pub fn inhibit_backoff(&self) {
        let mut core = self.inner.core();
        core.state = StreamState::Initial;
        core.backoff.reset();
    }

    pub fn reset_backoff(&self) {
        self.inner.core().backoff.reset();
    }

    /// Closes the stream after the idle timeout unless it is used again.
    pub fn mark_idle(&self) {
        let mut core = self.inner.core();
        if !matches!(core.state, StreamState::Open | StreamState::Healthy) || core.idle_timer.is_some() {
            return;
        }
        let stream = self.clone();
        core.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.timers.idle,
            self.inner.settings.idle_timeout,
            move || async move {
                if stream.is_open() {
                    log::debug!("closing idle {} stream", stream.inner.rpc_name);
                    stream.inner.core().idle_timer = None;
                    stream.close(StreamState::Initial, None)?;
                }
                Ok(())
            },
        ));
    }

    pub(crate) fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        let stream = {
            let mut core = self.inner.core();
            if let Some(timer) = core.idle_timer.take() {
                timer.cancel();
            }
            core.stream.clone()
        };
        match stream {
            Some(stream) => stream.send(message),
            None => {
                log::debug!("dropping {} request on a closed stream", self.inner.rpc_name);
                Ok(())
            }
        }
    }

    /// Tears the stream down after a response that could not be decoded.
    /// The owner reconnects and replays its targets or batches, so nothing
    /// from the bad response is applied.
    pub(crate) fn fail_with_malformed_response(&self, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("{} stream sent a malformed response: {error}", self.inner.rpc_name);
        let error = FirestoreError::new(FirestoreErrorCode::Unknown, error.message());
        self.close(StreamState::Error, Some(error))
    }

    fn perform_backoff(&self, core: &mut StreamCore) {
        core.state = StreamState::Backoff;
        let stream = self.clone();
        let op = core
            .backoff
            .backoff_and_run(&self.inner.queue, self.inner.timers.backoff, move || async move {
                {
                    let mut core = stream.inner.core();
                    if core.state != StreamState::Backoff {
                        return Ok(());
                    }
                    core.backoff_op = None;
                    core.state = StreamState::Initial;
                }
                stream.start();
                Ok(())
            });
        core.backoff_op = Some(op);
    }

    fn on_stream_opened(&self, generation: u64, duplex: DuplexStream) -> FirestoreResult<()> {
        let duplex = Arc::new(duplex);
        {
            let mut core = self.inner.core();
            if core.generation != generation || core.state != StreamState::Starting {
                duplex.close();
                return Ok(());
            }
            core.state = StreamState::Open;
            core.stream = Some(Arc::clone(&duplex));
            let stream = self.clone();
            core.health_check = Some(self.inner.queue.enqueue_after_delay(
                TimerId::HealthCheckTimeout,
                self.inner.settings.health_check_delay,
                move || async move {
                    let mut core = stream.inner.core();
                    if core.generation == generation && core.state == StreamState::Open {
                        core.state = StreamState::Healthy;
                    }
                    Ok(())
                },
            ));
        }
        log::debug!("{} stream opened", self.inner.rpc_name);
        self.spawn_reader(generation, duplex);
        match self.inner.handler.upgrade() {
            Some(handler) => handler.on_open(),
            None => Ok(()),
        }
    }

    fn spawn_reader(&self, generation: u64, duplex: Arc<DuplexStream>) {
        let inner = Arc::clone(&self.inner);
        runtime::spawn_detached(async move {
            loop {
                let next = duplex.next().await;
                let finished = !matches!(next, Some(Ok(_)));
                let stream = PersistentStream {
                    inner: Arc::clone(&inner),
                };
                inner.queue.enqueue_and_forget(move || async move {
                    match next {
                        Some(Ok(message)) => stream.on_stream_message(generation, message),
                        Some(Err(err)) => stream.on_stream_closed(generation, Some(err)),
                        None => stream.on_stream_closed(generation, None),
                    }
                });
                if finished {
                    break;
                }
            }
        });
    }

    fn on_stream_message(&self, generation: u64, message: JsonValue) -> FirestoreResult<()> {
        if self.inner.core().generation != generation {
            return Ok(());
        }
        match self.inner.handler.upgrade() {
            Some(handler) => handler.on_message(message),
            None => Ok(()),
        }
    }

    fn on_stream_closed(&self, generation: u64, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if self.inner.core().generation != generation {
            return Ok(());
        }
        log::debug!(
            "{} stream closed: {}",
            self.inner.rpc_name,
            error.as_ref().map_or_else(|| "no error".to_string(), ToString::to_string)
        );
        self.close(StreamState::Error, error)
    }

    fn close(&self, final_state: StreamState, error: Option<FirestoreError>) -> FirestoreResult<()> {
        {
            let mut core = self.inner.core();
            for timer in [
                core.idle_timer.take(),
                core.health_check.take(),
                core.backoff_op.take(),
            ]
            .into_iter()
            .flatten()
            {
                timer.cancel();
            }
            core.generation += 1;

            let code = error.as_ref().map(|error| error.code);
            if final_state != StreamState::Error {
                core.backoff.reset();
            } else if code == Some(FirestoreErrorCode::ResourceExhausted) {
                log::warn!(
                    "{} stream hit a resource limit, backing off for the maximum delay",
                    self.inner.rpc_name
                );
                core.backoff.reset_to_max();
            } else if code == Some(FirestoreErrorCode::Unauthenticated) && core.state != StreamState::Healthy {
                // A token that never worked is likely expired.
                self.inner.credentials.invalidate_token();
            }

            if let Some(stream) = core.stream.take() {
                stream.close();
            }
            core.state = final_state;
        }
        match self.inner.handler.upgrade() {
            Some(handler) => handler.on_close(error),
            None => Ok(()),
        }
    }
}

impl StreamInner {
    fn core(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::credentials::StaticCredentialsProvider;
    use crate::firestore::credentials::User;
    use crate::firestore::error::unauthenticated;
    use crate::firestore::remote::connection::{InMemoryConnection, LISTEN_RPC};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl StreamHandler for Recorder {
        fn on_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".into());
            Ok(())
        }

        fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(format!("message {message}"));
            Ok(())
        }

        fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            let code = error.map_or("none", |error| error.code_str());
            self.events.lock().unwrap().push(format!("close {code}"));
            Ok(())
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.events.lock().unwrap().len() >= count {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} stream events");
    }

    #[tokio::test]
    async fn delivers_messages_then_backs_off_after_errors() {
        let (connection, server) = InMemoryConnection::pair();
        let credentials = StaticCredentialsProvider::new(User::new("alice"), Some("secret".into()));
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn StreamHandler> = recorder.clone();
        let queue = AsyncQueue::new();
        let stream = PersistentStream::new(
            LISTEN_RPC,
            StreamTimers {
                idle: TimerId::ListenStreamIdle,
                backoff: TimerId::ListenStreamConnectionBackoff,
            },
            StreamSettings::default(),
            queue.clone(),
            connection,
            credentials.clone(),
            Arc::downgrade(&handler),
        );

        let starter = stream.clone();
        queue.enqueue(move || async move {
            starter.start();
            Ok(())
        })
        .await
        .unwrap();
        let remote = server.accept().await.unwrap();
        assert_eq!(remote.auth_token.as_deref(), Some("secret"));
        wait_for(&recorder, 1).await;
        assert!(stream.is_open());

        remote.send(json!({ "targetChange": {} })).unwrap();
        wait_for(&recorder, 2).await;
        remote.fail(unauthenticated("expired"));
        wait_for(&recorder, 3).await;
        assert_eq!(stream.state(), StreamState::Error);
        assert_eq!(credentials.invalidation_count(), 1);

        let restarter = stream.clone();
        queue.enqueue(move || async move {
            restarter.start();
            Ok(())
        })
        .await
        .unwrap();
        // The first retry after a failure is immediate.
        assert!(server.accept().await.is_some());
        wait_for(&recorder, 4).await;
        assert!(stream.is_open());

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events[0], "open");
        assert!(events[1].starts_with("message"));
        assert_eq!(events[2], "close firestore/unauthenticated");
        assert_eq!(events[3], "open");
    }

    #[tokio::test]
    async fn idle_streams_close_cleanly() {
        let (connection, server) = InMemoryConnection::pair();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn StreamHandler> = recorder.clone();
        let queue = AsyncQueue::new();
        let stream = PersistentStream::new(
            LISTEN_RPC,
            StreamTimers {
                idle: TimerId::ListenStreamIdle,
                backoff: TimerId::ListenStreamConnectionBackoff,
            },
            StreamSettings::default(),
            queue.clone(),
            connection,
            Arc::new(crate::firestore::credentials::EmptyCredentialsProvider),
            Arc::downgrade(&handler),
        );
        let starter = stream.clone();
        queue.enqueue(move || async move {
            starter.start();
            Ok(())
        })
        .await
        .unwrap();
        let _remote = server.accept().await.unwrap();
        wait_for(&recorder, 1).await;

        let idler = stream.clone();
        queue.enqueue(move || async move {
            idler.mark_idle();
            Ok(())
        })
        .await
        .unwrap();
        queue.run_delayed_operations_early(TimerId::ListenStreamIdle).await.unwrap();
        assert_eq!(stream.state(), StreamState::Initial);
        assert_eq!(recorder.events.lock().unwrap().last().unwrap(), "close none");
    }
}
