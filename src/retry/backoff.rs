//! Jittered backoff intervals.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A source of random jitter.
///
/// Implementations return a duration uniformly drawn from `[0, upper)`, and
/// `Duration::ZERO` when `upper` is zero.
///
/// # Examples
///
/// ```
/// use steadfetch::retry::JitterSource;
/// use std::time::Duration;
///
/// /// Always adds half of the allowed jitter.
/// struct Half;
///
/// impl JitterSource for Half {
///     fn sample(&self, upper: Duration) -> Duration {
///         upper / 2
///     }
/// }
///
/// assert_eq!(Half.sample(Duration::from_millis(50)), Duration::from_millis(25));
/// ```
pub trait JitterSource: Send + Sync {
    /// Draws a jitter value in `[0, upper)`.
    fn sample(&self, upper: Duration) -> Duration;
}

/// Jitter drawn from the thread-local random generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self, upper: Duration) -> Duration {
        sample_with(&mut rand::thread_rng(), upper)
    }
}

/// Deterministic jitter from a seeded generator.
///
/// Two sources created with the same seed produce the same sequence.
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl fmt::Debug for SeededJitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededJitter").finish_non_exhaustive()
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self, upper: Duration) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        sample_with(&mut *rng, upper)
    }
}

fn sample_with<R: Rng + ?Sized>(rng: &mut R, upper: Duration) -> Duration {
    let upper_nanos = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
    if upper_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(0..upper_nanos))
}

/// Base interval plus bounded random jitter.
///
/// Every call to [`next_interval`](Self::next_interval) draws fresh jitter,
/// so the result lies in `[interval, interval + jitter)`.
#[derive(Clone)]
pub struct Backoff {
    interval: Duration,
    jitter: Duration,
    source: Arc<dyn JitterSource>,
}

impl Backoff {
    pub fn new(interval: Duration, jitter: Duration, source: Arc<dyn JitterSource>) -> Self {
        Self {
            interval,
            jitter,
            source,
        }
    }

    /// Computes the wait before the next attempt, saturating at
    /// `Duration::MAX`.
    pub fn next_interval(&self) -> Duration {
        self.interval.saturating_add(self.source.sample(self.jitter))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("interval", &self.interval)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_stays_within_jitter_window() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Arc::new(ThreadRngJitter),
        );

        for _ in 0..1000 {
            let wait = backoff.next_interval();
            assert!(wait >= Duration::from_millis(100));
            assert!(wait < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let a = SeededJitter::new(42);
        let b = SeededJitter::new(42);
        let upper = Duration::from_millis(500);

        let first: Vec<_> = (0..16).map(|_| a.sample(upper)).collect();
        let second: Vec<_> = (0..16).map(|_| b.sample(upper)).collect();

        assert_eq!(first, second);
        assert!(first.iter().all(|d| *d < upper));
    }

    #[test]
    fn test_huge_interval_saturates() {
        let backoff = Backoff::new(
            Duration::MAX,
            Duration::from_millis(1),
            Arc::new(SeededJitter::new(3)),
        );
        assert_eq!(backoff.next_interval(), Duration::MAX);

        let backoff = Backoff::new(Duration::MAX, Duration::MAX, Arc::new(ThreadRngJitter));
        assert_eq!(backoff.next_interval(), Duration::MAX);
    }

    #[test]
    fn test_zero_upper_bound_yields_zero() {
        assert_eq!(ThreadRngJitter.sample(Duration::ZERO), Duration::ZERO);
        assert_eq!(SeededJitter::new(7).sample(Duration::ZERO), Duration::ZERO);
    }
}
