use std::future::Future;
use std::time::Duration;

/// Spawns a background task on the ambient executor.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns a background task on the ambient executor.
///
/// Inside a tokio runtime the task joins that runtime. Outside of one, a
/// dedicated current-thread runtime driven by its own OS thread picks it up.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use tokio::runtime::Handle;

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(handle) = background_handle() {
        handle.spawn(future);
    } else {
        log::error!("no runtime available to spawn background task");
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn background_handle() -> Option<&'static tokio::runtime::Handle> {
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle};

    static BACKGROUND: LazyLock<Option<Handle>> = LazyLock::new(|| {
        let runtime = match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                log::error!("failed to build background tokio runtime: {err}");
                return None;
            }
        };
        let handle = runtime.handle().clone();
        let spawned = std::thread::Builder::new()
            .name("firestore-sync-runtime".into())
            .spawn(move || runtime.block_on(std::future::pending::<()>()));
        match spawned {
            Ok(_) => Some(handle),
            Err(err) => {
                log::error!("failed to start background runtime thread: {err}");
                None
            }
        }
    });

    BACKGROUND.as_ref()
}

/// Asynchronously waits for the provided duration in a platform-compatible way.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    use gloo_timers::future::sleep;
    sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    use tokio::time::sleep;
    sleep(duration).await;
}

/// Milliseconds since the Unix epoch according to the wall clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawns_without_ambient_runtime() {
        let (tx, rx) = mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(5)).await;
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        sleep(Duration::ZERO).await;
        assert!(now_millis() > 0);
    }
}
