//! # TTL Cache
//!
//! Local store of the last-fetched remote object per ID. `get` never serves an
//! entry older than the TTL without refetching, and `expire` forces the next
//! `get` to refetch regardless of age, which is what makes push invalidation
//! take effect immediately.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::trace;

/// Fetches a single object from the remote API.
pub type Fetch<T> = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

struct CacheLine<T> {
    value: Arc<T>,
    fetched_at: Instant,
}

impl<T> CacheLine<T> {
    fn live(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Concurrent TTL cache keyed by remote object ID.
pub struct Cache<T> {
    lines: DashMap<String, CacheLine<T>>,
    ttl: Duration,
    fetch: Fetch<T>,
}

impl<T: Send + Sync + 'static> Cache<T> {
    pub fn new<F, Fut>(ttl: Duration, fetch: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            lines: DashMap::new(),
            ttl,
            fetch: Arc::new(move |id| Box::pin(fetch(id))),
        }
    }

    /// Serve a live entry or fetch, store and return a fresh one.
    pub async fn get(&self, id: &str) -> anyhow::Result<Arc<T>> {
        if let Some(line) = self.lines.get(id) {
            if line.live(self.ttl) {
                return Ok(Arc::clone(&line.value));
            }
        }

        self.set(id).await
    }

    /// Fetch `id` unconditionally and store the result.
    pub async fn set(&self, id: &str) -> anyhow::Result<Arc<T>> {
        trace!(id = %id, "cache miss, fetching");
        let value = Arc::new((self.fetch)(id.to_string()).await?);
        self.lines.insert(
            id.to_string(),
            CacheLine {
                value: Arc::clone(&value),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Prime the cache with an object obtained elsewhere (e.g. a list call).
    pub fn add(&self, id: &str, value: T) {
        self.lines.insert(
            id.to_string(),
            CacheLine {
                value: Arc::new(value),
                fetched_at: Instant::now(),
            },
        );
    }

    /// Invalidate a single entry.
    pub fn expire(&self, id: &str) {
        self.lines.remove(id);
    }

    /// Invalidate everything.
    pub fn wipe(&self) {
        self.lines.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
