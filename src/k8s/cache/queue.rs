/**
 * Rate limited, de-duplicating work queue
 *
 * Modeled after the client-go workqueue: an item is never processed by two
 * workers at the same time, and repeated adds of an item that has not been
 * picked up yet collapse into one. On top of that it can wait until a given
 * item has been fully processed, and can be reset wholesale during a resync.
 */
use super::rate_limiter::DefaultRateLimiter;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct QueueState {
    // Order in which items are worked on. Every element is in the dirty set
    // and not in the processing set.
    queue: VecDeque<String>,

    // Items expected to be added soon, e.g. waiting out a rate limit delay
    expected: HashSet<String>,

    // Items that need to be processed
    dirty: HashSet<String>,

    // Items currently being processed. These may be dirty at the same time,
    // in which case they go back on the queue when done.
    processing: HashSet<String>,

    rate_limiter: DefaultRateLimiter,

    // Bumped on every reset so delayed adds from before the reset are dropped
    epoch: u64,

    shutting_down: bool,
}

impl QueueState {
    fn is_pending(&self, item: &str) -> bool {
        self.expected.contains(item)
            || self.dirty.contains(item)
            || self.processing.contains(item)
            || self.rate_limiter.num_requeues(item) > 0
    }

    // for easier reading of debug output
    fn pretty_print_all(&self) -> String {
        let queue: Vec<&str> = self.queue.iter().map(String::as_str).collect();
        format!(
            "\n\texpected: {}\n\tdirty: {}\n\tprocessing: {}\n\tqueue: {}",
            print_one_item_per_line(sorted(&self.expected)),
            print_one_item_per_line(sorted(&self.dirty)),
            print_one_item_per_line(sorted(&self.processing)),
            print_one_item_per_line(queue),
        )
    }
}

fn sorted(set: &HashSet<String>) -> Vec<&str> {
    set.iter().map(String::as_str).collect::<BTreeSet<_>>().into_iter().collect()
}

fn print_one_item_per_line(items: Vec<&str>) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }
    let mut out = format!("[{}] [\n", items.len());
    for item in items {
        let _ = writeln!(out, "\t\t{item}");
    }
    out.push_str("\t]");
    out
}

/// A work queue that rate limits re-adds of failed items
#[derive(Debug)]
pub struct RateLimitingQueue {
    name: String,
    debug_enabled: bool,
    state: Mutex<QueueState>,
    // woken on every state change; waiters re-check their condition
    cond: Notify,
}

impl RateLimitingQueue {
    #[must_use]
    pub fn new(name: &str, debug_enabled: bool) -> Arc<Self> {
        if debug_enabled {
            info!("+RateLimitingQueue::new({})", name);
        }
        Arc::new(Self {
            name: name.to_string(),
            debug_enabled,
            state: Mutex::new(QueueState::default()),
            cond: Notify::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    // Sections under this lock never leave the state half-updated, so a
    // poisoned lock still holds consistent data
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trace(&self, op: &str, item: &str, state: &QueueState) {
        if self.debug_enabled {
            info!("[{}]: {}({}){}", self.name, op, item, state.pretty_print_all());
        }
    }

    /// Mark `item` as needing processing. No-op if it is already dirty; it is
    /// only queued right away if no worker is processing it at the moment.
    pub fn add(&self, item: &str) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.expected.remove(item);
        if state.dirty.contains(item) {
            // still wake up anyone waiting on the expected set
            drop(state);
            self.cond.notify_waiters();
            return;
        }
        state.dirty.insert(item.to_string());
        if !state.processing.contains(item) {
            state.queue.push_back(item.to_string());
        }
        self.trace("Add", item, &state);
        drop(state);
        self.cond.notify_waiters();
    }

    /// Add `item` once `delay` has passed. The item counts as expected in the
    /// meantime, so waiters keep waiting for it.
    pub fn add_after(self: &Arc<Self>, item: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let epoch = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.expected.insert(item.to_string());
            state.epoch
        };

        let queue = Arc::clone(self);
        let item = item.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add_if_current(&item, epoch);
        });
    }

    fn add_if_current(&self, item: &str, epoch: u64) {
        {
            let mut state = self.lock();
            if state.epoch != epoch {
                // scheduled before a reset, the rebuilt state doesn't need it
                state.expected.remove(item);
                self.trace("DropStale", item, &state);
                drop(state);
                self.cond.notify_waiters();
                return;
            }
        }
        self.add(item);
    }

    /// Add `item` after the delay the rate limiter says is ok
    pub fn add_rate_limited(self: &Arc<Self>, item: &str) {
        let delay = self.lock().rate_limiter.when(item);
        if self.debug_enabled {
            info!("[{}]: AddRateLimited({}) - in {} ms", self.name, item, delay.as_millis());
        }
        self.expect_add(item);
        self.add_after(item, delay);
    }

    /// Number of times `item` has been re-queued through the rate limiter
    #[must_use]
    pub fn num_requeues(&self, item: &str) -> usize {
        self.lock().rate_limiter.num_requeues(item)
    }

    /// Stop tracking retries of `item`
    pub fn forget(&self, item: &str) {
        self.lock().rate_limiter.forget(item);
        self.cond.notify_waiters();
    }

    /// Current queue length, for informational purposes only
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until an item is available. Returns `None` once the queue is
    /// shutting down, at which point the caller should exit. Every item
    /// returned must be handed back via [`RateLimitingQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            // Register interest before checking to avoid race
            let notified = self.cond.notified();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    self.trace("Get", &item, &state);
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as done processing. If it was marked dirty again in the
    /// meantime it goes back on the queue.
    pub fn done(&self, item: &str) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.to_string());
        }
        self.trace("Done", item, &state);
        drop(state);
        self.cond.notify_waiters();
    }

    /// Mark `item` as expected to be added in the near future
    pub fn expect_add(&self, item: &str) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.expected.insert(item.to_string());
        self.trace("ExpectAdd", item, &state);
    }

    #[must_use]
    pub fn is_processing(&self, item: &str) -> bool {
        let state = self.lock();
        !state.shutting_down && state.processing.contains(item)
    }

    /// Wait until `item` is neither expected, dirty nor being processed, and
    /// its retry count is back to zero. Returns right away on shutdown.
    pub async fn wait_until_forgotten(&self, item: &str) {
        if self.debug_enabled {
            info!("[{}]: +WaitUntilForgotten({})", self.name, item);
        }
        loop {
            let notified = self.cond.notified();

            {
                let state = self.lock();
                if state.shutting_down || !state.is_pending(item) {
                    break;
                }
                if self.debug_enabled {
                    debug!("[{}]: WaitUntilForgotten({}) {}", self.name, item, state.pretty_print_all());
                }
            }

            notified.await;
        }
        if self.debug_enabled {
            info!("[{}]: -WaitUntilForgotten({})", self.name, item);
        }
    }

    /// Drop all queued and in-flight work and rate limiter history. Items
    /// already handed out by [`RateLimitingQueue::get`] are no longer
    /// processing afterwards, so workers can tell they went stale. The
    /// expected set is kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        info!("+Reset(), [{}], queue size: [{}]", self.name, state.queue.len());

        state.queue.clear();
        state.dirty.clear();
        state.processing.clear();
        state.rate_limiter = DefaultRateLimiter::default();
        state.epoch += 1;
        drop(state);
        self.cond.notify_waiters();
    }

    /// Ignore all new items and wake up every blocked caller
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        if self.debug_enabled {
            info!(
                "[{}]: Queue shutdown, sizes [expected={}, dirty={}, processing={}, queue={}]",
                self.name,
                state.expected.len(),
                state.dirty.len(),
                state.processing.len(),
                state.queue.len()
            );
        }
        drop(state);
        self.cond.notify_waiters();
    }

    #[must_use]
    pub fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
