//! # Work Queue
//!
//! Per-object reconciliation queue.
//!
//! ## Guarantees
//!
//! - **Exclusive**: a key handed out by [`WorkQueue::get`] is not handed out
//!   again until [`WorkQueue::done`] is called for it. An `add` for a key
//!   that is being processed marks it dirty; `done` re-queues it.
//! - **Coalescing**: repeated `add`s of a key that is waiting in the queue
//!   produce a single delivery.
//! - **Delayed delivery**: [`WorkQueue::add_after`] schedules a key on a timer
//!   task without blocking other keys. Only the earliest pending timer per key
//!   is kept.
//! - **Bounded retries**: [`WorkQueue::add_rate_limited`] re-queues a key
//!   after a short fixed delay at most `max_immediate_retries` times in a
//!   row, then drops it. [`WorkQueue::forget`] resets the count and cancels
//!   any pending delayed delivery of the key.
//!
//! After [`WorkQueue::shut_down`], `get` returns `None` immediately, even if
//! keys are still queued; they are picked up again by the next leader's
//! initial listing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry bound for keys that fail without making progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive rate-limited re-queues allowed before a key is dropped
    pub max_immediate_retries: u32,
    /// Delay before each rate-limited re-queue
    pub immediate_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::constants::{DEFAULT_IMMEDIATE_RETRY_DELAY_MS, DEFAULT_MAX_IMMEDIATE_RETRIES};
        Self {
            max_immediate_retries: DEFAULT_MAX_IMMEDIATE_RETRIES,
            immediate_retry_delay: Duration::from_millis(DEFAULT_IMMEDIATE_RETRY_DELAY_MS),
        }
    }
}

#[derive(Debug)]
struct Inner<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-added while processing
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Earliest pending delayed delivery per key
    waiting: HashMap<K, Instant>,
    retries: HashMap<K, u32>,
    shutting_down: bool,
}

/// Deduplicating, per-key exclusive work queue
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    policy: RetryPolicy,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                retries: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            policy,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue a key for processing
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down || !inner.dirty.insert(key.clone()) {
            return;
        }
        if inner.processing.contains(&key) {
            // Re-delivered by done()
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Queue a key after `delay` without blocking the caller
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            match inner.waiting.get(&key) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    inner.waiting.insert(key.clone(), ready_at);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let still_ours = {
                let mut inner = queue.lock();
                if inner.waiting.get(&key) == Some(&ready_at) {
                    inner.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if still_ours {
                queue.add(key);
            }
        });
    }

    /// Re-queue a failing key with the bounded retry policy.
    ///
    /// Returns `false` when the retry budget is exhausted and the key was
    /// dropped.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> bool {
        let attempts = {
            let mut inner = self.lock();
            let counter = inner.retries.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        if attempts > self.policy.max_immediate_retries {
            warn!(
                "Dropping {:?} after {} consecutive failed retries",
                key, self.policy.max_immediate_retries
            );
            self.forget(&key);
            return false;
        }

        debug!("Rate-limited requeue of {:?} (attempt {})", key, attempts);
        self.add_after(key, self.policy.immediate_retry_delay);
        true
    }

    /// Reset the retry budget of a key and cancel its pending delayed
    /// delivery
    pub fn forget(&self, key: &K) {
        let mut inner = self.lock();
        inner.retries.remove(key);
        inner.waiting.remove(key);
    }

    /// Consecutive rate-limited re-queues recorded for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().retries.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key as finished. Re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
