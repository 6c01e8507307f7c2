use std::future::Future;
use std::time::Duration;

use crate::firestore::core::OnlineState;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::util::{AsyncQueue, DelayedOperation, TimerId};

/// Watch stream failures tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Infers the client's [`OnlineState`] from watch stream health.
///
/// A stream start moves to `Unknown` and arms a timer; if nothing succeeds
/// before it fires, or the stream fails outright, the client is `Offline`.
/// Any watch message makes it `Online`. Every method returns the new state
/// when it changed so the caller can broadcast it outside its own locks.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
    timeout: Duration,
}

impl OnlineStateTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            online_state_timer: None,
            should_warn_client_is_offline: true,
            timeout,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when the watch stream starts. `on_timeout` runs on `queue` if
    /// the connection attempt has not resolved within the grace period and
    /// must call [`handle_timeout`](Self::handle_timeout).
    pub fn handle_watch_stream_start<F, Fut>(&mut self, queue: &AsyncQueue, on_timeout: F) -> Option<OnlineState>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        self.clear_timer();
        self.online_state_timer = Some(queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.timeout,
            on_timeout,
        ));
        changed
    }

    pub fn handle_timeout(&mut self) -> Option<OnlineState> {
        self.online_state_timer = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline_warning(&format!(
            "Backend didn't respond within {} seconds.",
            self.timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: Option<&FirestoreError>) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy stream dropped; give the reconnect a chance first.
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
            return None;
        }
        self.clear_timer();
        let reason = error.map_or_else(|| "stream closed".to_string(), ToString::to_string);
        self.log_offline_warning(&format!(
            "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {reason}"
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Explicit transition, e.g. `Online` on a watch message or `Offline`
    /// when the network is disabled. Resets the failure count.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        log::debug!("online state {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        Some(state)
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }

    fn log_offline_warning(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode until it can connect."
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(Duration::from_secs(10));
        assert_eq!(tracker.handle_watch_stream_start(&queue, || async { Ok(()) }), None);
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        let error = unavailable("no route");
        assert_eq!(tracker.handle_watch_stream_failure(Some(&error)), Some(OnlineState::Offline));
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        // Further starts do not flap back to Unknown until something succeeds.
        assert_eq!(tracker.handle_watch_stream_start(&queue, || async { Ok(()) }), None);
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[tokio::test]
    async fn dropping_a_healthy_stream_is_unknown_first() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new(Duration::from_secs(10));
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(tracker.handle_watch_stream_failure(None), Some(OnlineState::Unknown));
        assert_eq!(tracker.set(OnlineState::Unknown), None);

        tracker.handle_watch_stream_start(&queue, || async { Ok(()) });
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }
}
