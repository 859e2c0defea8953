//! # Work Queue
//!
//! Deduplicating, retry-aware queue of string IDs feeding the controller
//! workers. Guarantees:
//!
//! - an ID is handed to at most one worker at a time; adding it again while
//!   it is being processed marks it dirty so it runs once more after `done`
//! - adding an ID that is already waiting is a no-op
//! - after `shutdown` every pending and future `get` returns `None`
//! - a queue replaced through [`WorkQueue::handover`] keeps its in-flight IDs
//!   blocked in the replacement until the old queue marks them done

pub mod rate_limiter;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    // earliest pending delayed add per item
    waiting: HashMap<String, Instant>,
    shutting_down: bool,
    // replacement queue holding our in-flight items as its own
    successor: Option<Arc<Shared>>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn add(&self, item: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(item) {
            return;
        }

        state.dirty.insert(item.to_string());
        if state.processing.contains(item) {
            trace!(id = %item, "item in flight, coalescing");
            return;
        }

        state.queue.push_back(item.to_string());
        drop(state);
        self.notify.notify_one();
    }

    fn done(&self, item: &str) {
        let mut state = self.state.lock();
        if !state.processing.remove(item) {
            return;
        }

        let requeue = state.dirty.contains(item) && !state.shutting_down;
        if requeue {
            state.queue.push_back(item.to_string());
        }
        let successor = state.successor.clone();
        drop(state);

        if requeue {
            self.notify.notify_one();
        }
        if let Some(successor) = successor {
            successor.done(item);
        }
    }
}

/// Rate-limited work queue of remote resource IDs.
pub struct WorkQueue {
    shared: Arc<Shared>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new(rate_limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
            rate_limiter,
        }
    }

    /// The limiter backing `add_rate_limited`, so a replacement queue can keep
    /// the same backoff configuration.
    #[must_use]
    pub fn rate_limiter(&self) -> Arc<dyn RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    /// Enqueue `item` for immediate processing.
    pub fn add(&self, item: &str) {
        self.shared.add(item);
    }

    /// Enqueue `item` once `delay` has elapsed. When the item is already
    /// waiting, the earlier of the two ready times wins.
    pub fn add_after(&self, item: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(item) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.waiting.insert(item.to_string(), ready_at);
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let item = item.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            {
                let mut state = shared.state.lock();
                // superseded by an earlier add_after
                if state.waiting.get(&item) != Some(&ready_at) {
                    return;
                }
                state.waiting.remove(&item);
            }
            shared.add(&item);
        });
    }

    /// Enqueue `item` after the delay its rate limiter dictates.
    pub fn add_rate_limited(&self, item: &str) {
        let delay = self.rate_limiter.when(item);
        trace!(id = %item, delay_ms = delay.as_millis(), "rate limited requeue");
        self.add_after(item, delay);
    }

    /// Stop tracking failures for `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &str) {
        self.rate_limiter.forget(item);
    }

    #[must_use]
    pub fn num_requeues(&self, item: &str) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the returned item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    // hand a possibly consumed permit on to the next waiter
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed. Re-queues it if it was added while in flight.
    pub fn done(&self, item: &str) {
        self.shared.done(item);
    }

    /// Shut this queue down and return an empty replacement.
    ///
    /// Items still being processed here count as in flight in the
    /// replacement: adding them there is coalesced until `done` is called on
    /// this queue, so a key is never processed by two workers across the swap.
    #[must_use]
    pub fn handover(&self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        let successor = Arc::new(Shared {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        });

        {
            let mut state = self.shared.state.lock();
            successor.state.lock().processing = state.processing.clone();
            state.successor = Some(Arc::clone(&successor));
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.waiting.clear();
        }
        self.shared.notify.notify_waiters();

        Self {
            shared: successor,
            rate_limiter,
        }
    }

    /// Reject new items and wake every blocked `get`.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.waiting.clear();
        }
        self.shared.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Number of items ready to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue {
        WorkQueue::new(Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        )))
    }

    #[tokio::test]
    async fn test_add_deduplicates_waiting_items() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_coalesced() {
        let q = queue();
        q.add("a");
        let item = q.get().await.unwrap();

        // in flight: not handed out again
        q.add("a");
        q.add("a");
        assert!(q.is_empty());

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done("a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_getters() {
        let q = Arc::new(queue());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };

        tokio::task::yield_now().await;
        q.shutdown();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("getter was not woken")
            .unwrap();
        assert!(got.is_none());

        q.add("late");
        assert!(q.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_ready_time() {
        let q = queue();
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(1));
        q.add_after("a", Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done("a");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_backs_off_until_forgotten() {
        let q = queue();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues("a"), 2);

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done("a");

        q.forget("a");
        assert_eq!(q.num_requeues("a"), 0);
    }

    #[tokio::test]
    async fn test_handover_keeps_in_flight_items_blocked() {
        let old = queue();
        old.add("a");
        old.add("b");
        let item = old.get().await.unwrap();
        assert_eq!(item, "a");

        let next = old.handover(Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        )));
        assert!(old.is_shutting_down());
        assert!(old.get().await.is_none());

        // "a" is still being worked on through the old queue
        next.add("a");
        next.add("b");
        assert_eq!(next.len(), 1);
        assert_eq!(next.get().await.as_deref(), Some("b"));

        old.done("a");
        assert_eq!(next.len(), 1);
        assert_eq!(next.get().await.as_deref(), Some("a"));
        next.done("a");
        next.done("b");
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_handover_chain_releases_through_every_queue() {
        let first = queue();
        first.add("a");
        let item = first.get().await.unwrap();

        let second = first.handover(first.rate_limiter());
        let third = second.handover(second.rate_limiter());

        third.add("a");
        assert!(third.is_empty());

        first.done(&item);
        assert_eq!(third.get().await.as_deref(), Some("a"));
    }
}
