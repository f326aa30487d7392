//! Work queue contracts.
//!
//! The controller drains a [`PriorityQueue`]. Queue constructors may also
//! hand back a plain [`RateLimitingQueue`] with no notion of priority; those
//! are wrapped by [`PriorityQueueWrapper`], which maps add options onto
//! `add` / `add_after` / `add_rate_limited` and reports priority 0.

pub mod fifo;
pub mod priority;
pub mod rate_limiter;

pub use fifo::FifoQueue;
pub use priority::PriorityWorkQueue;
pub use rate_limiter::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::reconcile::Request;

/// Longest delay a queue will honour; anything beyond is clamped.
const MAX_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `now + delay`, clamped so arbitrarily large delays cannot overflow.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

/// How an item should be (re-)inserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOpts {
    /// Higher dequeues first among ready items.
    pub priority: i32,
    /// Delay by the rate limiter. Takes precedence over `after`.
    pub rate_limited: bool,
    /// Delay by a fixed duration.
    pub after: Option<Duration>,
}

impl AddOpts {
    pub fn immediate(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn rate_limited(priority: i32) -> Self {
        Self {
            priority,
            rate_limited: true,
            after: None,
        }
    }

    pub fn after(priority: i32, delay: Duration) -> Self {
        Self {
            priority,
            rate_limited: false,
            after: Some(delay),
        }
    }
}

/// Queue the controller's workers pull from.
///
/// Implementations must guarantee that an item handed out by
/// `get_with_priority` is not handed out again until `done` is called for
/// it, and that adding an already-pending item does not create a second
/// entry.
#[async_trait]
pub trait PriorityQueue<K: Request>: Send + Sync {
    fn add_with_opts(&self, opts: AddOpts, item: K);

    /// Wait for the next ready item. `None` once the queue is shut down.
    async fn get_with_priority(&self) -> Option<(K, i32)>;

    /// Mark `item` as no longer being processed.
    fn done(&self, item: &K);

    /// Clear backoff state for `item`.
    fn forget(&self, item: &K);

    fn num_requeues(&self, item: &K) -> usize;

    /// Number of pending items, ready or delayed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shut_down(&self);

    fn is_shutting_down(&self) -> bool;

    fn add(&self, item: K) {
        self.add_with_opts(AddOpts::default(), item);
    }
}

/// A rate-limited work queue without priorities.
#[async_trait]
pub trait RateLimitingQueue<K: Request>: Send + Sync {
    fn add(&self, item: K);

    fn add_after(&self, item: K, delay: Duration);

    fn add_rate_limited(&self, item: K);

    /// Wait for the next ready item. `None` once the queue is shut down.
    async fn get(&self) -> Option<K>;

    fn done(&self, item: &K);

    fn forget(&self, item: &K);

    fn num_requeues(&self, item: &K) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shut_down(&self);

    fn is_shutting_down(&self) -> bool;
}

/// What a queue constructor produced.
pub enum QueueKind<K: Request> {
    Priority(Arc<dyn PriorityQueue<K>>),
    RateLimiting(Arc<dyn RateLimitingQueue<K>>),
}

impl<K: Request> QueueKind<K> {
    /// Resolve to a priority queue, wrapping plain queues.
    pub fn into_priority_queue(self) -> Arc<dyn PriorityQueue<K>> {
        match self {
            Self::Priority(queue) => queue,
            Self::RateLimiting(queue) => Arc::new(PriorityQueueWrapper::new(queue)),
        }
    }
}

/// Constructs the controller's queue from its name and rate limiter.
/// Called once per controller activation.
pub type NewQueueFn<K> =
    Arc<dyn Fn(&str, Arc<dyn RateLimiter<K>>) -> QueueKind<K> + Send + Sync>;

/// Default constructor: an in-memory [`PriorityWorkQueue`].
pub fn default_new_queue<K: Request>() -> NewQueueFn<K> {
    Arc::new(|name: &str, rate_limiter: Arc<dyn RateLimiter<K>>| {
        QueueKind::Priority(Arc::new(PriorityWorkQueue::new(name, rate_limiter)))
    })
}

/// Adapts a [`RateLimitingQueue`] to the [`PriorityQueue`] contract.
pub struct PriorityQueueWrapper<K: Request> {
    inner: Arc<dyn RateLimitingQueue<K>>,
}

impl<K: Request> PriorityQueueWrapper<K> {
    pub fn new(inner: Arc<dyn RateLimitingQueue<K>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<K: Request> PriorityQueue<K> for PriorityQueueWrapper<K> {
    fn add_with_opts(&self, opts: AddOpts, item: K) {
        match opts {
            AddOpts {
                rate_limited: true, ..
            } => self.inner.add_rate_limited(item),
            AddOpts {
                after: Some(delay), ..
            } if !delay.is_zero() => self.inner.add_after(item, delay),
            _ => self.inner.add(item),
        }
    }

    async fn get_with_priority(&self) -> Option<(K, i32)> {
        self.inner.get().await.map(|item| (item, 0))
    }

    fn done(&self, item: &K) {
        self.inner.done(item);
    }

    fn forget(&self, item: &K) {
        self.inner.forget(item);
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.inner.num_requeues(item)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn shut_down(&self) {
        self.inner.shut_down();
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }
}
