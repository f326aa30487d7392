//! In-memory priority work queue.
//!
//! Ready items dequeue by priority (highest first), ties broken by the order
//! in which they were first added. Delayed items are promoted to ready once
//! their time has come. An item handed to a worker is parked in the
//! processing set; re-adds while it is processing are remembered and only
//! become visible after `done`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::rate_limiter::RateLimiter;
use super::{AddOpts, PriorityQueue, deadline_after};
use crate::reconcile::Request;

#[derive(Debug, Clone, Copy)]
struct Entry {
    priority: i32,
    /// Insertion sequence; kept across re-adds so FIFO position is stable.
    seq: u64,
    ready_at: Option<Instant>,
}

struct State<K> {
    /// Every pending item, including ones parked behind a processing copy.
    pending: HashMap<K, Entry>,
    ready: BTreeMap<(Reverse<i32>, u64), K>,
    delayed: BTreeMap<(Instant, u64), K>,
    processing: HashSet<K>,
    next_seq: u64,
    shutting_down: bool,
}

impl<K: Request> State<K> {
    fn index(&mut self, item: &K, entry: Entry) {
        match entry.ready_at {
            Some(at) => {
                self.delayed.insert((at, entry.seq), item.clone());
            }
            None => {
                self.ready
                    .insert((Reverse(entry.priority), entry.seq), item.clone());
            }
        }
    }

    fn unindex(&mut self, entry: Entry) {
        match entry.ready_at {
            Some(at) => {
                self.delayed.remove(&(at, entry.seq));
            }
            None => {
                self.ready.remove(&(Reverse(entry.priority), entry.seq));
            }
        }
    }

    fn promote(&mut self, now: Instant) {
        while let Some(slot) = self.delayed.first_entry() {
            if slot.key().0 > now {
                break;
            }
            let ((_, seq), item) = slot.remove_entry();
            if let Some(entry) = self.pending.get_mut(&item) {
                entry.ready_at = None;
                let priority = entry.priority;
                self.ready.insert((Reverse(priority), seq), item);
            }
        }
    }

    fn pop_ready(&mut self) -> Option<(K, i32)> {
        let ((Reverse(priority), _), item) = self.ready.pop_first()?;
        self.pending.remove(&item);
        self.processing.insert(item.clone());
        Some((item, priority))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }
}

/// Default queue handed out by the controller's queue constructor.
pub struct PriorityWorkQueue<K: Request> {
    name: String,
    rate_limiter: Arc<dyn RateLimiter<K>>,
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Request> PriorityWorkQueue<K> {
    pub fn new(name: impl Into<String>, rate_limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            name: name.into(),
            rate_limiter,
            state: Mutex::new(State {
                pending: HashMap::new(),
                ready: BTreeMap::new(),
                delayed: BTreeMap::new(),
                processing: HashSet::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `item` is currently handed out to a worker.
    pub fn is_processing(&self, item: &K) -> bool {
        self.lock().processing.contains(item)
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, item: K, priority: i32, delay: Option<Duration>) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }

            let ready_at = delay.filter(|d| !d.is_zero()).map(deadline_after);
            let parked = st.processing.contains(&item);

            let seq = match st.pending.remove(&item) {
                Some(old) => {
                    if !parked {
                        st.unindex(old);
                    }
                    old.seq
                }
                None => {
                    let seq = st.next_seq;
                    st.next_seq = st.next_seq.wrapping_add(1);
                    seq
                }
            };

            let entry = Entry {
                priority,
                seq,
                ready_at,
            };
            if !parked {
                st.index(&item, entry);
            }
            st.pending.insert(item, entry);
        }
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl<K: Request> PriorityQueue<K> for PriorityWorkQueue<K> {
    fn add_with_opts(&self, opts: AddOpts, item: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = if opts.rate_limited {
            Some(self.rate_limiter.when(&item))
        } else {
            opts.after
        };
        self.insert(item, opts.priority, delay);
    }

    async fn get_with_priority(&self) -> Option<(K, i32)> {
        loop {
            // Register interest before looking at the state so a concurrent
            // add between the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote(Instant::now());
                if let Some(next) = st.pop_ready() {
                    return Some(next);
                }
                st.next_deadline()
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
            let parked = st.pending.get(item).copied();
            if let Some(entry) = parked {
                st.index(item, entry);
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
        self.lock().pending.len()
    }

    fn shut_down(&self) {
        self.lock().shutting_down = true;
        debug!(queue = %self.name, "queue shut down");
        self.notify.notify_waiters();
    }

    fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
