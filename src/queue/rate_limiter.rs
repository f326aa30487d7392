//! Backoff policies for rate-limited requeues.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use governor::Quota;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};

use crate::reconcile::Request;

/// Computes how long an item should wait before it is retried.
pub trait RateLimiter<K: Request>: Send + Sync {
    /// Delay for the next retry of `item`. Counts as a failure.
    fn when(&self, item: &K) -> Duration;

    /// Drop all backoff state for `item`.
    fn forget(&self, item: &K);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> usize;
}

/// Rate limiter used when none is configured: the slower of per-item
/// exponential backoff (5ms .. 1000s) and an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K: Request>() -> Arc<dyn RateLimiter<K>> {
    Arc::new(MaxOfRateLimiter::new(vec![
        Arc::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Arc::new(BucketRateLimiter::new(10, 100)),
    ]))
}

// ---------------------------------------------------------------------------
// Exponential per-item backoff
// ---------------------------------------------------------------------------

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Request> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Request> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // 2^exp overflows quickly; anything past 2^31 is over any sane cap.
        let factor = 2u32.checked_pow(exp.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .map_or(0, |n| *n as usize)
    }
}

// ---------------------------------------------------------------------------
// Token bucket (overall, not per item)
// ---------------------------------------------------------------------------

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Overall token bucket shared by every item. `when` takes a token if one
/// is available; otherwise it reports how long until the next one is.
pub struct BucketRateLimiter {
    limiter: DirectLimiter,
    clock: DefaultClock,
}

impl BucketRateLimiter {
    /// Zero rates are bumped to 1.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: governor::RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            clock: DefaultClock::default(),
        }
    }
}

impl<K: Request> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        match self.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> usize {
        0
    }
}

// ---------------------------------------------------------------------------
// Max-of composition
// ---------------------------------------------------------------------------

/// Returns the longest delay of all wrapped limiters.
pub struct MaxOfRateLimiter<K: Request> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K: Request> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K: Request> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}
