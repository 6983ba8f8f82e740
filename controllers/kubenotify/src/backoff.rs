//! # Rate limiters
//!
//! Decide how long a failed work item waits before it becomes visible in the
//! scheduling queue again.
//!
//! Two independent limiters are composed with [`MaxOfRateLimiter`]:
//! - [`ItemExponentialBackoff`]: per-item delay doubling on every failure
//!   (1s, 2s, 4s, ... capped at the maximum), reset by `forget`.
//! - [`TokenBucket`]: a global ceiling on how fast retries flow back in,
//!   shared by every item.
//!
//! The effective delay is the larger of the two.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default token bucket refill rate (tokens per second).
pub const DEFAULT_QPS: f64 = 10.0;
/// Default token bucket capacity.
pub const DEFAULT_BURST: u32 = 100;

/// Computes a retry delay per item.
pub trait RateLimiter<T>: Send {
    /// Delay before `item` should be retried. Records one more failure.
    fn when(&mut self, item: &T) -> Duration;

    /// Clears any failure history kept for `item`.
    fn forget(&mut self, item: &T);

    /// Number of failures recorded for `item`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Calculate the exponential backoff for a given failure count (stateless).
///
/// Returns `base * 2^failures`, capped at `max`.
#[must_use]
pub fn exponential_for_error_count(failures: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(failures)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Per-item exponential backoff.
#[derive(Debug, Clone)]
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash> ItemExponentialBackoff<T> {
    /// Create a new backoff starting at `base` and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let delay = exponential_for_error_count(*failures, self.base, self.max);
        *failures = failures.saturating_add(1);
        delay
    }

    fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}

/// Global token bucket.
///
/// Every call to `when` reserves one token. While tokens remain the delay is
/// zero; once the bucket is drained, the delay is the time until the reserved
/// token is refilled.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket refilling at `rate` tokens per second.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            rate,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// Reserve one token at `now` and return how long the caller must wait.
    pub fn reserve_at(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = self.last.max(now);
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 || self.rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&mut self, _item: &T) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn forget(&mut self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters: the delay is the maximum over all of them.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> std::fmt::Debug for MaxOfRateLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<T> MaxOfRateLimiter<T> {
    /// Compose the given limiters.
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&mut self, item: &T) -> Duration {
        self.limiters
            .iter_mut()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, item: &T) {
        for limiter in &mut self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Default limiter for the controller queue: per-item exponential backoff
/// between `init` and `max`, bounded by a 10 qps / 100 burst token bucket.
#[must_use]
pub fn controller_rate_limiter<T>(init: Duration, max: Duration) -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(init, max)),
        Box::new(TokenBucket::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        let item = "Deployment;default/web".to_string();

        // 1s, 2s, 4s, ..., 256s, then capped at 5m
        let delays: Vec<u64> = (0..11).map(|_| backoff.when(&item).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert_eq!(backoff.num_requeues(&item), 11);
    }

    #[test]
    fn test_exponential_backoff_is_per_item_and_resets() {
        let mut backoff = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        let a = "a".to_string();
        let b = "b".to_string();

        backoff.when(&a);
        backoff.when(&a);
        assert_eq!(backoff.when(&b), Duration::from_millis(5), "b has its own history");
        assert_eq!(backoff.when(&a), Duration::from_millis(20));

        backoff.forget(&a);
        assert_eq!(backoff.num_requeues(&a), 0);
        assert_eq!(backoff.when(&a), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_for_error_count_never_overflows() {
        let max = Duration::from_secs(300);
        assert_eq!(exponential_for_error_count(64, Duration::from_secs(1), max), max);
        assert_eq!(exponential_for_error_count(u32::MAX, Duration::from_secs(1), max), max);
    }

    #[test]
    fn test_backoff_is_monotonic_up_to_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let delays: Vec<Duration> = (0..20).map(|k| exponential_for_error_count(k, base, max)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), max);
    }

    #[test]
    fn test_token_bucket_burst_then_throttles() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 3);
        bucket.last = start;

        for _ in 0..3 {
            assert_eq!(bucket.reserve_at(start), Duration::ZERO);
        }
        // Fourth token is 100ms away, fifth 200ms
        assert_eq!(bucket.reserve_at(start).as_millis(), 100);
        assert_eq!(bucket.reserve_at(start).as_millis(), 200);
    }

    #[test]
    fn test_token_bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 1);
        bucket.last = start;

        assert_eq!(bucket.reserve_at(start), Duration::ZERO);
        assert_eq!(bucket.reserve_at(start + Duration::from_millis(150)), Duration::ZERO);
    }

    #[test]
    fn test_max_of_takes_largest_delay() {
        let mut limiter: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1))),
        ]);
        let item = "x".to_string();

        assert_eq!(limiter.when(&item), Duration::from_millis(50));
        assert_eq!(limiter.when(&item), Duration::from_millis(100));
        assert_eq!(limiter.num_requeues(&item), 2);

        limiter.forget(&item);
        assert_eq!(limiter.num_requeues(&item), 0);
    }

    #[test]
    fn test_controller_rate_limiter_first_delay_is_backoff() {
        let mut limiter = controller_rate_limiter::<String>(Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(limiter.when(&"k".to_string()), Duration::from_secs(1));
    }
}
