//! Plain rate-limiting FIFO queue with no priorities.
//!
//! Adding an item that is already queued is a no-op; adding one that is
//! being processed marks it dirty so it is queued again on `done`. Delayed
//! adds keep the earliest requested time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{RateLimitingQueue, deadline_after};
use super::rate_limiter::RateLimiter;
use crate::reconcile::Request;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BTreeMap<(Instant, u64), K>,
    waiting_for: HashMap<K, (Instant, u64)>,
    next_seq: u64,
    shutting_down: bool,
}

impl<K: Request> State<K> {
    fn add(&mut self, item: K) {
        if !self.dirty.insert(item.clone()) {
            return;
        }
        if self.processing.contains(&item) {
            return;
        }
        self.queue.push_back(item);
    }

    fn promote(&mut self, now: Instant) {
        while let Some(slot) = self.waiting.first_entry() {
            if slot.key().0 > now {
                break;
            }
            let (_, item) = slot.remove_entry();
            self.waiting_for.remove(&item);
            self.add(item);
        }
    }
}

pub struct FifoQueue<K: Request> {
    rate_limiter: Arc<dyn RateLimiter<K>>,
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Request> FifoQueue<K> {
    pub fn new(rate_limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            rate_limiter,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BTreeMap::new(),
                waiting_for: HashMap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<K: Request> RateLimitingQueue<K> for FifoQueue<K> {
    fn add(&self, item: K) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.add(item);
        }
        self.notify.notify_waiters();
    }

    fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let at = deadline_after(delay);
            let scheduled = st.waiting_for.get(&item).copied();
            if let Some((existing, seq)) = scheduled {
                if existing <= at {
                    return;
                }
                st.waiting.remove(&(existing, seq));
            }
            let seq = st.next_seq;
            st.next_seq = st.next_seq.wrapping_add(1);
            st.waiting.insert((at, seq), item.clone());
            st.waiting_for.insert(item, (at, seq));
        }
        self.notify.notify_waiters();
    }

    fn add_rate_limited(&self, item: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote(Instant::now());
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    return Some(item);
                }
                st.waiting.keys().next().map(|(at, _)| *at)
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn done(&self, item: &K) {
        {
            let mut st = self.lock();
            st.processing.remove(item);
            if st.dirty.contains(item) {
                st.queue.push_back(item.clone());
            }
        }
        self.notify.notify_waiters();
    }

    fn forget(&self, item: &K) {
        self.rate_limiter.forget(item);
    }

    fn num_requeues(&self, item: &K) -> usize {
        self.rate_limiter.num_requeues(item)
    }

    fn len(&self) -> usize {
        let st = self.lock();
        let delayed_only = st
            .waiting_for
            .keys()
            .filter(|item| !st.dirty.contains(*item))
            .count();
        st.dirty.len() + delayed_only
    }

    fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
