//! Serialized task queue that every client operation runs on.
//!
//! Operations are drained one at a time by a single worker task, so code
//! running on the queue never observes another queued operation mid-flight.
//! Delayed operations (stream idle timers, backoff, GC, lease refresh) are
//! registered with a [`TimerId`] so tests can run them early and shutdown can
//! cancel them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::FutureExt;

use crate::firestore::error::{
    failed_precondition, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::platform::runtime;

#[cfg(target_arch = "wasm32")]
pub type QueueFuture = futures::future::LocalBoxFuture<'static, ()>;
#[cfg(not(target_arch = "wasm32"))]
pub type QueueFuture = futures::future::BoxFuture<'static, ()>;

#[cfg(target_arch = "wasm32")]
fn box_queue_future<F>(future: F) -> QueueFuture
where
    F: Future<Output = ()> + 'static,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
fn box_queue_future<F>(future: F) -> QueueFuture
where
    F: Future<Output = ()> + Send + 'static,
{
    future.boxed()
}

/// Identifies the kind of a delayed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerId {
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    IndexBackfill,
    RetryTransaction,
    /// Retry of an operation that failed on transient storage errors.
    AsyncQueueRetry,
}

type DelayedOp = Box<dyn FnOnce() -> QueueFuture + Send>;

struct DelayedEntry {
    timer_id: TimerId,
    target_time: Instant,
    op: DelayedOp,
}

#[derive(Default)]
struct QueueState {
    shutting_down: bool,
    operation_in_progress: bool,
    failure: Option<FirestoreError>,
    delayed: BTreeMap<u64, DelayedEntry>,
    next_delayed_id: u64,
}

struct AsyncQueueInner {
    sender: Sender<QueueFuture>,
    state: Mutex<QueueState>,
}

impl AsyncQueueInner {
    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

impl AsyncQueue {
    /// Creates the queue and spawns its worker on the ambient runtime.
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                state: Mutex::new(QueueState::default()),
            }),
        };
        Self::start_worker(receiver, Arc::downgrade(&queue.inner));
        queue
    }

    fn start_worker(receiver: Receiver<QueueFuture>, queue: Weak<AsyncQueueInner>) {
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                set_in_progress(&queue, true);
                task.await;
                set_in_progress(&queue, false);
            }
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().shutting_down
    }

    /// Runs `op` on the queue and resolves with its result.
    ///
    /// Must not be awaited from inside another queued operation: the worker
    /// would wait on itself.
    pub async fn enqueue<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        self.check_accepting()?;
        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);
        self.push(box_queue_future(async move {
            if let Some(error) = current_failure(&weak) {
                let _ = tx.send(Err(error));
                return;
            }
            let result = op().await;
            if let Err(error) = &result {
                record_failure(&weak, error);
            }
            let _ = tx.send(result);
        }))?;
        rx.await
            .map_err(|_| failed_precondition("The client has already been terminated."))?
    }

    /// Schedules `op` without waiting for it. Errors are logged.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("dropping operation scheduled after shutdown");
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let pushed = self.push(box_queue_future(async move {
            if current_failure(&weak).is_some() {
                return;
            }
            if let Err(error) = op().await {
                log::warn!("async queue operation failed: {error}");
                record_failure(&weak, &error);
            }
        }));
        if let Err(err) = pushed {
            log::debug!("failed to schedule operation: {err}");
        }
    }

    /// Like [`enqueue_and_forget`](Self::enqueue_and_forget) but keeps accepting
    /// work during shutdown. Used by the shutdown sequence itself.
    pub(crate) async fn enqueue_even_while_shutting_down<T, F, Fut>(
        &self,
        op: F,
    ) -> FirestoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(box_queue_future(async move {
            let _ = tx.send(op().await);
        }))?;
        rx.await
            .map_err(|_| failed_precondition("The client has already been terminated."))?
    }

    /// Runs `op` on the queue after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let id = {
            let mut state = self.inner.state();
            let id = state.next_delayed_id;
            state.next_delayed_id += 1;
            state.delayed.insert(
                id,
                DelayedEntry {
                    timer_id,
                    target_time: Instant::now() + delay,
                    op: Box::new(move || {
                        box_queue_future(async move {
                            if let Err(error) = op().await {
                                log::warn!("delayed operation {timer_id:?} failed: {error}");
                            }
                        })
                    }),
                },
            );
            id
        };

        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                AsyncQueue { inner }.fire_delayed(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
        }
    }

    fn fire_delayed(&self, id: u64) {
        let entry = self.inner.state().delayed.remove(&id);
        if let Some(entry) = entry {
            if let Err(err) = self.push((entry.op)()) {
                log::debug!("dropping delayed operation {:?}: {err}", entry.timer_id);
            }
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state()
            .delayed
            .values()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Fires every pending delayed operation in target-time order, stopping
    /// after the first one registered with `last_timer_id`
    /// ([`TimerId::All`] runs everything), then waits for the queue to drain.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        let ops = {
            let mut state = self.inner.state();
            let mut ordered: Vec<(u64, Instant, TimerId)> = state
                .delayed
                .iter()
                .map(|(id, entry)| (*id, entry.target_time, entry.timer_id))
                .collect();
            ordered.sort_by_key(|(id, target, _)| (*target, *id));
            let mut ops = Vec::new();
            for (id, _, timer_id) in ordered {
                if let Some(entry) = state.delayed.remove(&id) {
                    ops.push(entry.op);
                }
                if last_timer_id != TimerId::All && timer_id == last_timer_id {
                    break;
                }
            }
            ops
        };
        for op in ops {
            self.push(op())?;
        }
        self.drain().await
    }

    /// Resolves once every operation enqueued so far has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_shutting_down(|| async { Ok(()) })
            .await
    }

    /// Rejects all further work and runs `op` as the last operation.
    /// Calling it again once shutdown has begun is a no-op.
    pub async fn shutdown<F, Fut>(&self, op: F) -> FirestoreResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            return Ok(());
        }
        self.enter_restricted_mode();
        self.enqueue_even_while_shutting_down(op).await
    }

    /// Fails unless called from inside an operation running on this queue.
    pub fn verify_operation_in_progress(&self) -> FirestoreResult<()> {
        if self.inner.state().operation_in_progress {
            Ok(())
        } else {
            Err(internal_error(
                "Expected to be called from inside an AsyncQueue operation",
            ))
        }
    }

    /// Stops accepting new work and cancels all delayed operations.
    pub fn enter_restricted_mode(&self) {
        let mut state = self.inner.state();
        state.shutting_down = true;
        state.delayed.clear();
    }

    pub fn failure(&self) -> Option<FirestoreError> {
        self.inner.state().failure.clone()
    }

    fn check_accepting(&self) -> FirestoreResult<()> {
        let state = self.inner.state();
        if state.shutting_down {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    fn push(&self, task: QueueFuture) -> FirestoreResult<()> {
        self.inner
            .sender
            .try_send(task)
            .map_err(|err| internal_error(format!("failed to enqueue operation: {err}")))
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn set_in_progress(queue: &Weak<AsyncQueueInner>, value: bool) {
    if let Some(inner) = queue.upgrade() {
        inner.state().operation_in_progress = value;
    }
}

fn current_failure(queue: &Weak<AsyncQueueInner>) -> Option<FirestoreError> {
    let inner = queue.upgrade()?;
    let failure = inner.state().failure.clone();
    failure.map(|error| internal_error(format!("AsyncQueue is already failed: {error}")))
}

fn record_failure(queue: &Weak<AsyncQueueInner>, error: &FirestoreError) {
    if error.code != FirestoreErrorCode::Internal {
        return;
    }
    if let Some(inner) = queue.upgrade() {
        log::error!("INTERNAL UNHANDLED ERROR: {error}");
        inner.state().failure.get_or_insert_with(|| error.clone());
    }
}

/// Handle to an operation scheduled with
/// [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<AsyncQueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Cancels the operation if it has not started yet.
    pub fn cancel(&self) {
        if let Some(inner) = self.queue.upgrade() {
            inner.state().delayed.remove(&self.id);
        }
    }

    /// Runs the operation now instead of waiting for its timer.
    pub fn skip_delay(&self) {
        if let Some(inner) = self.queue.upgrade() {
            AsyncQueue { inner }.fire_delayed(self.id);
        }
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_operations_in_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(move || async move {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        let value = queue.enqueue(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delayed_operations_can_run_early_or_be_cancelled() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let first = {
            let counter = Arc::clone(&counter);
            queue.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(60), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let second = {
            let counter = Arc::clone(&counter);
            queue.enqueue_after_delay(TimerId::IndexBackfill, Duration::from_secs(60), move || async move {
                counter.fetch_add(10, Ordering::SeqCst);
                Ok(())
            })
        };
        second.cancel();
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
        assert!(!queue.contains_delayed_operation(TimerId::IndexBackfill));

        queue
            .run_delayed_operations_early(TimerId::LruGarbageCollection)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        first.cancel();
    }

    #[tokio::test]
    async fn delayed_operation_fires_after_timer() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _op = {
            let counter = Arc::clone(&counter);
            queue.enqueue_after_delay(TimerId::RetryTransaction, Duration::from_millis(10), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn internal_errors_fail_the_queue() {
        let queue = AsyncQueue::new();
        let err = queue
            .enqueue(|| async { Err::<(), _>(internal_error("broken invariant")) })
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        let next = queue.enqueue(|| async { Ok(1) }).await.unwrap_err();
        assert!(next.message().contains("already failed"));
    }

    #[tokio::test]
    async fn rejects_work_after_shutdown() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        let err = queue.enqueue(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        queue.drain().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_runs_final_operation_then_rejects() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue
            .shutdown(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(queue.is_shutting_down());
        assert!(queue.enqueue(|| async { Ok(()) }).await.is_err());
    }

    #[tokio::test]
    async fn verifies_queue_context() {
        let queue = AsyncQueue::new();
        assert!(queue.verify_operation_in_progress().is_err());
        let inner = queue.clone();
        queue
            .enqueue(move || async move { inner.verify_operation_in_progress() })
            .await
            .unwrap();
    }
}
