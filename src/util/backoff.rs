use std::time::{Duration, Instant};

use std::future::Future;

use rand::Rng;

use crate::firestore::error::FirestoreResult;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Exponential backoff with jitter used between stream reconnect attempts.
///
/// The first attempt after a [`reset`](ExponentialBackoff::reset) is
/// immediate. Every following attempt multiplies the base delay by the
/// configured factor and adds up to +/- 50% jitter, capped at the max delay.
/// The delay is measured from the previous attempt, so time already spent
/// waiting elsewhere counts towards it.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
    last_attempt: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
            last_attempt: None,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait for the full max delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Returns how long to wait before the next attempt and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub(crate) fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let now = Instant::now();
        let desired = jittered(self.current_base, rng);
        let elapsed = self
            .last_attempt
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO);
        let remaining = desired.saturating_sub(elapsed);

        if !self.current_base.is_zero() {
            log::debug!(
                "backing off for {} ms (base delay {} ms, {} ms since last attempt)",
                remaining.as_millis(),
                self.current_base.as_millis(),
                elapsed.as_millis()
            );
        }

        self.last_attempt = Some(now + remaining);
        self.current_base = self.advance(self.current_base);
        remaining
    }

    /// Schedules `op` on `queue` after the next backoff delay.
    pub fn backoff_and_run<F, Fut>(
        &mut self,
        queue: &AsyncQueue,
        timer_id: TimerId,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let delay = self.next_delay();
        queue.enqueue_after_delay(timer_id, delay, op)
    }

    fn advance(&self, base: Duration) -> Duration {
        if base.is_zero() {
            return self.config.initial_delay.min(self.config.max_delay);
        }
        base.mul_f64(self.config.backoff_factor)
            .clamp(self.config.initial_delay, self.config.max_delay)
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let millis = base.as_millis() as f64;
    let jitter = RANDOM_FACTOR * millis * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((millis + jitter).round().max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fast_config() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = ExponentialBackoff::new(fast_config());
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_millis(100));
    }

    #[test]
    fn base_grows_by_factor_until_cap() {
        let mut backoff = ExponentialBackoff::new(fast_config());
        let mut rng = StdRng::seed_from_u64(7);
        let mut bases = Vec::new();
        for _ in 0..10 {
            backoff.next_delay_with_rng(&mut rng);
            bases.push(backoff.current_base().as_millis());
        }
        assert_eq!(bases[0], 100);
        assert_eq!(bases[1], 150);
        assert_eq!(bases[2], 225);
        assert_eq!(*bases.last().unwrap(), 1_000);
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let value = jittered(Duration::from_millis(1_000), &mut rng).as_millis();
            assert!((500..=1_500).contains(&value));
        }
    }

    #[test]
    fn reset_to_max_jumps_to_ceiling() {
        let mut backoff = ExponentialBackoff::new(fast_config());
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_millis(1_000));
        backoff.reset();
        assert_eq!(backoff.current_base(), Duration::ZERO);
    }
}
