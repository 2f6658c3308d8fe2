//! Deduplicating, rate-limited work queue of `service_id` keys, built
//! directly since no crate in this dependency stack reproduces
//! client-go's `workqueue`. Three properties:
//!
//! 1. dedup while pending or in-flight,
//! 2. delayed enqueue (`add_after`),
//! 3. per-key exponential backoff (`add`, `forget`, `num_requeues`).
//!
//! The shape below follows client-go's own queue: a FIFO of ready keys, a
//! "dirty" set of keys that are queued-or-need-to-be, and a "processing"
//! set of keys currently handed out. A key dirty while processing is not
//! re-added to the ready queue; it is remembered and pushed back in when
//! `done` is called for that key.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::cmp::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1000);

struct Delayed {
    ready_at: Instant,
    key: String,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}
impl Eq for Delayed {}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so the BinaryHeap (a max-heap) pops the earliest deadline first.
        other.ready_at.cmp(&self.ready_at)
    }
}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    ready: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    /// Keys that became dirty again while they were processing; re-queued
    /// at `done()` time instead of being handed out a second time.
    redo: HashSet<String>,
    delayed: BinaryHeap<Delayed>,
    failures: HashMap<String, u32>,
    shutdown: bool,
    draining: bool,
}

impl Inner {
    fn new() -> Self {
        Inner {
            ready: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            redo: HashSet::new(),
            delayed: BinaryHeap::new(),
            failures: HashMap::new(),
            shutdown: false,
            draining: false,
        }
    }

    /// Core of `Add`: mark `key` dirty and make it ready unless it's
    /// already pending or currently being processed.
    fn add_now(&mut self, key: String) {
        if self.shutdown {
            return;
        }
        if self.dirty.contains(&key) {
            return;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            self.redo.insert(key);
            return;
        }
        self.ready.push_back(key);
    }
}

/// Handle returned by [`RateLimitingQueue::get`]. Call [`Done::done`] (or
/// drop it) exactly once to release the in-flight slot for its key.
pub struct Done {
    key: Option<String>,
    queue: Arc<Shared>,
}

impl Done {
    pub fn key(&self) -> &str {
        self.key.as_deref().expect("key taken")
    }

    pub fn done(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(key) = self.key.take() {
            self.queue.mark_done(key);
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        self.finish();
    }
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Shared {
    fn mark_done(&self, key: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(&key);
        if inner.redo.remove(&key) {
            inner.dirty.remove(&key);
            // Went dirty again while processing: re-add cleanly.
            inner.add_now(key);
        } else {
            inner.dirty.remove(&key);
        }
        self.cond.notify_all();
    }
}

/// Result of [`RateLimitingQueue::get`].
pub enum Item {
    Key(String, Done),
    Shutdown,
}

/// Deduplicating, rate-limited key queue. Clone is shallow (shares state).
#[derive(Clone)]
pub struct RateLimitingQueue {
    shared: Arc<Shared>,
    delay_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for RateLimitingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitingQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::new()),
            cond: Condvar::new(),
        });
        let queue = RateLimitingQueue {
            shared: shared.clone(),
            delay_task: Arc::new(Mutex::new(None)),
        };
        let task = tokio::spawn(Self::run_delay_loop(shared));
        *queue.delay_task.lock().unwrap() = Some(task);
        queue
    }

    async fn run_delay_loop(shared: Arc<Shared>) {
        loop {
            let wait_for = {
                let inner = shared.inner.lock().unwrap();
                if inner.shutdown && !inner.draining {
                    return;
                }
                match inner.delayed.peek() {
                    Some(d) => d.ready_at.saturating_duration_since(Instant::now()),
                    None => Duration::from_millis(50),
                }
            };
            tokio::time::sleep(wait_for.min(Duration::from_secs(1))).await;

            let mut inner = shared.inner.lock().unwrap();
            let now = Instant::now();
            let mut ready_keys = Vec::new();
            while let Some(d) = inner.delayed.peek() {
                if d.ready_at <= now {
                    ready_keys.push(inner.delayed.pop().unwrap().key);
                } else {
                    break;
                }
            }
            let should_exit = inner.shutdown && !inner.draining && inner.delayed.is_empty();
            for key in ready_keys {
                inner.add_now(key);
            }
            if !inner.ready.is_empty() {
                shared.cond.notify_all();
            }
            if should_exit {
                return;
            }
        }
    }

    /// Enqueue `key` immediately (coalesced if already pending/in-flight).
    /// Backoff only applies when the reconciler explicitly re-adds via
    /// [`Self::add_rate_limited`] after a failure.
    pub fn add(&self, key: impl Into<String>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.add_now(key.into());
        self.shared.cond.notify_all();
    }

    /// Schedule `key` for availability after `delay`. Coalesced with
    /// pending entries: if it's already in flight this just records the
    /// eventual re-add like `Add` would.
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        inner.delayed.push(Delayed {
            ready_at: Instant::now() + delay,
            key,
        });
    }

    /// Add `key` after its per-key exponential backoff delay (initial 5ms,
    /// doubling, capped at 1000s), incrementing its failure counter.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut inner = self.shared.inner.lock().unwrap();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let exp = *failures;
            *failures += 1;
            backoff_for(exp)
        };
        self.add_after(key, delay);
    }

    /// Reset the failure counter for `key`. Call this only on success —
    /// calling it alongside a failure-path `add_after` would silently
    /// defeat exponential backoff.
    pub fn forget(&self, key: &str) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        let inner = self.shared.inner.lock().unwrap();
        *inner.failures.get(key).unwrap_or(&0)
    }

    /// Increment `key`'s failure counter without scheduling anything,
    /// returning the new count. Lets a caller track a retry budget
    /// (`NumRequeues` vs a goal-set's `max_retries`) while still scheduling
    /// its own fixed-interval retry via [`Self::add_after`] instead of the
    /// exponential delay [`Self::add_rate_limited`] would compute.
    pub fn note_failure(&self, key: &str) -> u32 {
        let mut inner = self.shared.inner.lock().unwrap();
        let failures = inner.failures.entry(key.to_owned()).or_insert(0);
        *failures += 1;
        *failures
    }

    pub fn len(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a key is ready or the queue shuts down.
    pub fn get(&self) -> Item {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if let Some(key) = inner.ready.pop_front() {
                inner.processing.insert(key.clone());
                // Matches client-go's own Get: clearing dirty here is what
                // makes a concurrent Add during processing fall through to
                // the `processing` check in `add_now` and populate `redo`,
                // instead of returning early on a stale dirty flag.
                inner.dirty.remove(&key);
                return Item::Key(
                    key.clone(),
                    Done {
                        key: Some(key),
                        queue: self.shared.clone(),
                    },
                );
            }
            if inner.shutdown {
                return Item::Shutdown;
            }
            inner = self.shared.cond.wait(inner).unwrap();
        }
    }

    /// Close the queue immediately: no more keys are ever handed out,
    /// pending or delayed or not.
    pub fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.shutdown = true;
        inner.draining = false;
        self.shared.cond.notify_all();
    }

    /// Refuse new `add`/`add_after` calls but let keys already ready drain
    /// through `get`/`done` before `get` starts returning
    /// [`Item::Shutdown`].
    pub fn shutdown_with_drain(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.shutdown = true;
        inner.draining = true;
        self.shared.cond.notify_all();
    }
}

fn backoff_for(failures: u32) -> Duration {
    let millis = INITIAL_BACKOFF.as_millis().saturating_mul(1u128 << failures.min(20));
    Duration::from_millis(millis.min(MAX_BACKOFF.as_millis()) as u64)
}
