// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Jittered exponential backoff for retry loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use faas_config::params::{BACKOFF_FACTOR, BACKOFF_MAX, BACKOFF_MIN};
use rand::Rng;

/// A duration counter between `min` and `max`. Each call to
/// [`Backoff::duration`] multiplies the current step by `factor`; jitter
/// randomizes each step to ease contention between concurrent retriers.
#[derive(Debug)]
pub struct Backoff {
    attempt: AtomicU64,
    factor: f64,
    jitter: bool,
    min: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(BACKOFF_MIN, BACKOFF_MAX, BACKOFF_FACTOR)
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Backoff {
            attempt: AtomicU64::new(0),
            factor,
            jitter: true,
            min,
            max,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// The duration for the current attempt; increments the counter.
    pub fn duration(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
        self.for_attempt(attempt)
    }

    /// The duration for a specific attempt (first attempt is 0). Does not
    /// touch the counter, so it is safe to share.
    pub fn for_attempt(&self, attempt: u64) -> Duration {
        let min = self.min.as_secs_f64();
        let max = self.max.as_secs_f64();
        if min >= max {
            return self.max;
        }

        let mut dur = min * self.factor.powf(attempt as f64);
        if self.jitter {
            dur = rand::thread_rng().gen::<f64>() * (dur - min) + min;
        }
        Duration::from_secs_f64(dur.clamp(min, max))
    }

    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Relaxed);
    }

    pub fn attempt(&self) -> u64 {
        self.attempt.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_saturates() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0)
            .without_jitter();
        assert_eq!(b.for_attempt(0), Duration::from_millis(100));
        assert_eq!(b.for_attempt(1), Duration::from_millis(200));
        assert_eq!(b.for_attempt(2), Duration::from_millis(400));
        assert_eq!(b.for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = Backoff::default();
        for attempt in 0..12 {
            let d = b.for_attempt(attempt);
            assert!(d >= BACKOFF_MIN && d <= BACKOFF_MAX, "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn counter_advances_and_resets() {
        let b = Backoff::default();
        let _ = b.duration();
        let _ = b.duration();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }
}
