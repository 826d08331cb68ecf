//! Reconnect scheduling.
//!
//! Exponential backoff with Gaussian jitter. Each decision samples a delay
//! around the current nominal delay (standard deviation 10%), clamps it to
//! the ceiling, then grows the nominal delay for the next decision. The
//! growth does not depend on the sampled jitter.

use std::time::Duration;

use rand_distr::{Distribution, Normal};

use crate::config::RetryConfig;

/// Backoff state for one session
#[derive(Debug, Clone)]
pub struct RetryController {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: Option<u32>,
    retry_count: u32,
    current_delay: Duration,
    stopped: bool,
}

impl RetryController {
    /// Controller starting at the configured initial delay
    pub fn new(config: &RetryConfig) -> Self {
        let initial_delay = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial_delay,
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_retries: u32::try_from(config.max_retries).ok(),
            retry_count: 0,
            current_delay: initial_delay,
            stopped: false,
        }
    }

    /// Decide on the next retry.
    ///
    /// Returns the jittered delay to wait, or `None` when retrying stopped
    /// or the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.stopped || self.is_exhausted() {
            return None;
        }

        let delay = self.sample();
        self.retry_count += 1;
        self.current_delay = self
            .current_delay
            .mul_f64(self.multiplier)
            .min(self.max_delay);

        tracing::debug!(
            "Retry {} scheduled in {:?} (next nominal {:?})",
            self.retry_count,
            delay,
            self.current_delay
        );
        Some(delay)
    }

    fn sample(&self) -> Duration {
        let mean = self.current_delay.as_secs_f64();
        let jittered = match Normal::new(mean, mean * 0.1) {
            Ok(normal) => normal.sample(&mut rand::thread_rng()),
            Err(_) => mean,
        };
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }

    /// Nominal delay the next decision is centred on
    pub fn nominal_delay(&self) -> Duration {
        self.current_delay
    }

    /// Retries decided so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.max_retries
            .is_some_and(|max| self.retry_count >= max)
    }

    /// Refuse further retries (user-initiated close)
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Forget earlier failures after a successful connection
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.current_delay = self.initial_delay;
        self.stopped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(initial: u64, max: u64, multiplier: f64, max_retries: i32) -> RetryConfig {
        RetryConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier,
            max_retries,
        }
    }

    #[test]
    fn test_nominal_delays_grow_to_ceiling() {
        let mut retry = RetryController::new(&config(3000, 60_000, 1.5, -1));
        let mut nominal = vec![retry.nominal_delay()];
        for _ in 0..12 {
            retry.next_delay().unwrap();
            nominal.push(retry.nominal_delay());
        }
        assert_eq!(nominal[0], Duration::from_secs(3));
        assert_eq!(nominal[1], Duration::from_millis(4500));
        assert!(nominal.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*nominal.last().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_retries_never_schedules() {
        let mut retry = RetryController::new(&config(3000, 60_000, 1.5, 0));
        assert!(retry.is_exhausted());
        assert_eq!(retry.next_delay(), None);
    }

    #[test]
    fn test_max_retries_and_reset() {
        let mut retry = RetryController::new(&config(10, 100, 1.5, 2));
        assert!(retry.next_delay().is_some());
        assert!(retry.next_delay().is_some());
        assert_eq!(retry.next_delay(), None);
        assert_eq!(retry.retry_count(), 2);

        retry.reset();
        assert_eq!(retry.nominal_delay(), Duration::from_millis(10));
        assert!(retry.next_delay().is_some());
    }

    #[test]
    fn test_stop() {
        let mut retry = RetryController::new(&config(10, 100, 1.5, -1));
        retry.stop();
        assert!(retry.is_stopped());
        assert_eq!(retry.next_delay(), None);
    }

    proptest! {
        #[test]
        fn prop_delays_bounded_and_nominal_monotone(
            initial in 1u64..10_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..3.0,
            steps in 1usize..40,
        ) {
            let max = initial + extra;
            let mut retry = RetryController::new(&config(initial, max, multiplier, -1));
            let mut last = retry.nominal_delay();
            for _ in 0..steps {
                let delay = retry.next_delay().unwrap();
                prop_assert!(delay <= Duration::from_millis(max));
                let nominal = retry.nominal_delay();
                prop_assert!(nominal >= last);
                prop_assert!(nominal <= Duration::from_millis(max));
                last = nominal;
            }
        }

        #[test]
        fn prop_retry_budget_respected(max_retries in 0i32..20) {
            let mut retry = RetryController::new(&config(1, 10, 1.5, max_retries));
            let mut scheduled = 0;
            while retry.next_delay().is_some() {
                scheduled += 1;
                prop_assert!(scheduled <= max_retries);
            }
            prop_assert_eq!(scheduled, max_retries);
        }
    }
}
