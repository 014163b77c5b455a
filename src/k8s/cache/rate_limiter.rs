/**
 * Rate limiters deciding how long a work item waits before it is re-queued
 */
use super::config::{RATE_LIMIT_BASE_DELAY, RATE_LIMIT_BURST, RATE_LIMIT_MAX_DELAY, RATE_LIMIT_QPS};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl ItemExponentialFailureRateLimiter {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay for the next attempt of `item`. Counts as one more failure
    pub fn when(&mut self, item: &str) -> Duration {
        let exp = self.failures.get(item).copied().unwrap_or(0);
        self.failures.insert(item.to_string(), exp.saturating_add(1));

        2_u32
            .checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    #[must_use]
    pub fn num_requeues(&self, item: &str) -> usize {
        self.failures.get(item).copied().unwrap_or(0) as usize
    }

    pub fn forget(&mut self, item: &str) {
        self.failures.remove(item);
    }
}

/// Overall token bucket, shared by all items
pub struct BucketRateLimiter {
    limiter: DefaultDirectRateLimiter,
    clock: DefaultClock,
}

impl std::fmt::Debug for BucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRateLimiter").finish_non_exhaustive()
    }
}

impl BucketRateLimiter {
    #[must_use]
    pub fn new(qps: NonZeroU32, burst: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(qps).allow_burst(burst)),
            clock: DefaultClock::default(),
        }
    }

    /// Take one token if there is one, otherwise return how long until the
    /// next one is available
    pub fn when(&self) -> Duration {
        match self.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }
}

/// The default controller rate limiter: the slower of the per-item
/// exponential backoff and the overall bucket
#[derive(Debug)]
pub struct DefaultRateLimiter {
    items: ItemExponentialFailureRateLimiter,
    bucket: BucketRateLimiter,
}

impl Default for DefaultRateLimiter {
    fn default() -> Self {
        Self {
            items: ItemExponentialFailureRateLimiter::new(RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_DELAY),
            bucket: BucketRateLimiter::new(RATE_LIMIT_QPS, RATE_LIMIT_BURST),
        }
    }
}

impl DefaultRateLimiter {
    pub fn when(&mut self, item: &str) -> Duration {
        let per_item = self.items.when(item);
        let overall = self.bucket.when();
        per_item.max(overall)
    }

    #[must_use]
    pub fn num_requeues(&self, item: &str) -> usize {
        self.items.num_requeues(item)
    }

    pub fn forget(&mut self, item: &str) {
        self.items.forget(item);
    }
}
