//! # Reconciler Contract
//!
//! Every resource domain (services, pipeline gates, restores, namespaces,
//! stack runs, ...) plugs into the engine by implementing [`Reconciler`].
//! The engine only ever talks to a domain through this trait, so Kubernetes
//! objects and non-object work share one scheduling and supervision machine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::cache::Cache;
use crate::queue::{default_controller_rate_limiter, RateLimiter, WorkQueue};
use crate::socket::Publisher;

/// Outcome of a successful reconcile.
///
/// Ignored entirely when the reconcile returned an error: errors always
/// retry with exponential backoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue through the rate limiter (keeps backoff history).
    pub requeue: bool,
    /// Requeue after a fixed delay (clears backoff history first). Wins over `requeue`.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Done; no automatic requeue until poll or push adds the ID again.
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        !self.requeue && self.requeue_after.map_or(true, |d| d.is_zero())
    }
}

/// Per-call context handed to [`Reconciler::reconcile`].
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// Unique ID of this reconcile invocation, also recorded on the tracing span.
    pub reconcile_id: Uuid,
    /// Cancelled on shutdown. Long-running reconciles should honor it.
    pub cancel: CancellationToken,
    /// Upper bound the reconciler should apply when waiting for caches to sync.
    pub cache_sync_timeout: Duration,
}

/// How often a reconciler wants to be polled.
///
/// Read again before every wait, so a dynamic provider can change cadence or
/// pause polling (by returning zero) without tearing down the poll loop.
#[derive(Clone)]
pub enum PollInterval {
    Static(Duration),
    Dynamic(Arc<dyn Fn() -> Duration + Send + Sync>),
}

impl PollInterval {
    pub fn dynamic<F>(provider: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(provider))
    }

    /// Current interval. Zero means polling is paused.
    #[must_use]
    pub fn get(&self) -> Duration {
        match self {
            Self::Static(interval) => *interval,
            Self::Dynamic(provider) => provider(),
        }
    }
}

impl fmt::Debug for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(interval) => f.debug_tuple("Static").field(interval).finish(),
            Self::Dynamic(_) => f.debug_tuple("Dynamic").field(&self.get()).finish(),
        }
    }
}

impl From<Duration> for PollInterval {
    fn from(interval: Duration) -> Self {
        Self::Static(interval)
    }
}

/// One resource domain's sync logic.
///
/// `reconcile` must be idempotent: the same ID can be enqueued by poll and by
/// push at the same time. The queue guarantees it is never reconciled
/// concurrently with itself.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Bring the local state for `id` in line with the remote definition.
    async fn reconcile(&self, ctx: &ReconcileContext, id: &str)
        -> anyhow::Result<ReconcileResult>;

    /// Enumerate remote objects and enqueue their IDs.
    async fn poll(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// The queue currently feeding this reconciler. Callers must not cache the
    /// returned handle across iterations: `restart` swaps it.
    fn queue(&self) -> Arc<WorkQueue>;

    /// Push event name and the publisher handling it.
    fn publisher(&self) -> (String, Arc<dyn Publisher>);

    /// Custom cadence. `None` falls back to the manager's poll interval plus jitter.
    fn poll_interval(&self) -> Option<PollInterval> {
        None
    }

    /// Recycle the queue and cache. Must not try to interrupt an in-flight reconcile.
    fn restart(&self);

    /// Terminal cleanup on process shutdown.
    fn shutdown(&self);
}

/// Queue and cache pair owned by a reconciler.
///
/// Keeps the current queue behind a lock so `restart` can swap it while
/// workers and publishers keep reading the slot instead of a stale handle.
pub struct ReconcilerState<T> {
    queue: RwLock<Arc<WorkQueue>>,
    cache: Cache<T>,
    rate_limiter: fn() -> Arc<dyn RateLimiter>,
}

impl<T: Send + Sync + 'static> ReconcilerState<T> {
    #[must_use]
    pub fn new(cache: Cache<T>) -> Self {
        Self::with_rate_limiter(cache, default_controller_rate_limiter)
    }

    /// Use a custom limiter factory. Each recycled queue gets a fresh limiter.
    #[must_use]
    pub fn with_rate_limiter(cache: Cache<T>, rate_limiter: fn() -> Arc<dyn RateLimiter>) -> Self {
        Self {
            queue: RwLock::new(Arc::new(WorkQueue::new(rate_limiter()))),
            cache,
            rate_limiter,
        }
    }

    #[must_use]
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue.read())
    }

    #[must_use]
    pub fn cache(&self) -> &Cache<T> {
        &self.cache
    }

    /// Replace the queue with an empty one, shut the old one down and wipe the cache.
    ///
    /// IDs still in flight on the old queue stay blocked in the new one until
    /// their reconcile finishes.
    pub fn recycle(&self) {
        {
            let mut slot = self.queue.write();
            let fresh = Arc::new(slot.handover((self.rate_limiter)()));
            *slot = fresh;
        }
        self.cache.wipe();
        debug!("queue and cache recycled");
    }

    /// Terminal: shut the current queue down.
    pub fn shutdown(&self) {
        self.queue.read().shutdown();
    }
}
