//! # Push Path
//!
//! The console pushes "object X changed" events over a websocket. Each event
//! name maps to exactly one [`Publisher`], which invalidates the reconciler's
//! cache entry and enqueues the ID so the change is picked up without waiting
//! for the next poll.

pub mod phoenix;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::reconciler::ReconcilerState;

pub use phoenix::{PhoenixSocket, SocketArgs};

/// Handles one push event type.
pub trait Publisher: Send + Sync {
    /// `force` additionally clears the item's retry backoff.
    fn publish(&self, id: &str, force: bool);
}

/// Publisher bound to a reconciler's queue and cache.
///
/// Holds a weak reference so it never keeps a dropped reconciler alive, and
/// always reads the current queue so a supervisor restart is transparent.
pub struct QueuePublisher<T> {
    state: Weak<ReconcilerState<T>>,
}

impl<T> QueuePublisher<T> {
    #[must_use]
    pub fn new(state: &Arc<ReconcilerState<T>>) -> Self {
        Self {
            state: Arc::downgrade(state),
        }
    }
}

impl<T: Send + Sync + 'static> Publisher for QueuePublisher<T> {
    fn publish(&self, id: &str, force: bool) {
        let Some(state) = self.state.upgrade() else {
            debug!(id = %id, "publisher target dropped, ignoring event");
            return;
        };

        state.cache().expire(id);
        let queue = state.queue();
        if force {
            queue.forget(id);
        }
        queue.add(id);
    }
}

/// Event name to publisher map shared by socket implementations.
#[derive(Default)]
pub struct PublisherRegistry {
    publishers: DashMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `publisher` for `event`. The first registration wins; later
    /// ones are ignored and reported as `false`.
    pub fn register(&self, event: &str, publisher: Arc<dyn Publisher>) -> bool {
        match self.publishers.entry(event.to_string()) {
            Entry::Occupied(_) => {
                warn!(event = %event, "publisher already registered, ignoring");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(publisher);
                true
            }
        }
    }

    /// Route an event to its publisher. Returns `false` for unknown events.
    pub fn dispatch(&self, event: &str, id: &str, force: bool) -> bool {
        // clone out so the publisher runs without holding the shard lock
        let publisher = self.publishers.get(event).map(|p| Arc::clone(p.value()));
        match publisher {
            Some(publisher) => {
                publisher.publish(id, force);
                true
            }
            None => {
                debug!(event = %event, "no publisher for event");
                false
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

/// Push event transport.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Route `event` to `publisher`. Only the first registration per event sticks.
    fn add_publisher(&self, event: &str, publisher: Arc<dyn Publisher>);

    /// Make sure the socket is connected and joined to its channel. Called
    /// periodically; must be cheap when already joined.
    async fn join(&self) -> anyhow::Result<()>;
}
