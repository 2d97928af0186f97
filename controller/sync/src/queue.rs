//! A deduplicating, rate-limited work queue.
//!
//! An item is in at most one of three places: queued (waiting for a worker),
//! processing (handed to a worker), or neither. Adding an item that is already
//! queued is a no-op. Adding an item that is being processed marks it dirty so
//! that it is queued again once the worker calls [`WorkQueue::done`]. This
//! guarantees that no two workers process the same item at once and that no
//! update is lost while an item is in flight.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, hash::Hash, sync::Arc};
use tokio::{sync::Notify, time};

const DEFAULT_BASE_DELAY: time::Duration = time::Duration::from_millis(5);
const DEFAULT_MAX_DELAY: time::Duration = time::Duration::from_secs(1000);

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

/// Per-item exponential backoff for failed items.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: time::Duration,
    pub max: time::Duration,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

// === impl WorkQueue ===

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Marks an item as needing processing.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // Requeued by `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds an item once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: time::Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds an item after its backoff delay, increasing the delay for the next
    /// failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears an item's backoff state.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Returns the number of times an item has been rate limited since it was
    /// last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next item to process.
    ///
    /// Returns `None` once the queue is shut down. The caller must call
    /// [`WorkQueue::done`] when it finishes processing the item.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks an item as processed, queueing it again if it was added while
    /// being processed.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out items. Items already being processed may still be
    /// marked done.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Returns the number of items waiting for a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    /// Returns the delay after `failures` prior failures: `base * 2^failures`,
    /// capped at `max`.
    pub fn delay(&self, failures: u32) -> time::Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
