//! # Controller
//!
//! Runs one reconciler: a pool of workers draining its queue, the poll entry
//! point the scheduler drives, and the heartbeat the supervisor watches.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::queue::WorkQueue;
use crate::reconciler::{PollInterval, ReconcileContext, ReconcileResult, Reconciler};

/// Per-controller settings derived from the manager options.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub max_concurrent_reconciles: usize,
    pub cache_sync_timeout: Duration,
    pub recover_panic: bool,
    pub poll_interval: PollInterval,
}

/// Point-in-time view of a controller, served on the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerHealth {
    pub name: String,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_reconcile: Option<DateTime<Utc>>,
    pub heartbeat_age_ms: u64,
    pub poll_interval_ms: u64,
    pub restart_count: u64,
}

/// Time of the last completed poll cycle.
#[derive(Debug)]
pub struct Heartbeat {
    at: Mutex<Instant>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            at: Mutex::new(Instant::now()),
        }
    }
}

impl Heartbeat {
    pub fn beat(&self) {
        *self.at.lock() = Instant::now();
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.at.lock().elapsed()
    }
}

pub struct Controller {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    options: ControllerOptions,
    heartbeat: Heartbeat,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    last_reconcile: Mutex<Option<DateTime<Utc>>>,
    restarts: AtomicU64,
}

impl Controller {
    pub fn new(name: impl Into<String>, reconciler: Arc<dyn Reconciler>, options: ControllerOptions) -> Self {
        Self {
            name: name.into(),
            reconciler,
            options,
            heartbeat: Heartbeat::default(),
            last_poll: Mutex::new(None),
            last_reconcile: Mutex::new(None),
            restarts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<dyn Reconciler> {
        &self.reconciler
    }

    /// Current poll cadence. Zero while polling is paused.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.options.poll_interval.get()
    }

    /// The interval provider, for the poll scheduler to re-read every cycle.
    #[must_use]
    pub fn poll_interval_provider(&self) -> PollInterval {
        self.options.poll_interval.clone()
    }

    #[must_use]
    pub fn heartbeat_age(&self) -> Duration {
        self.heartbeat.age()
    }

    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_reconcile(&self) -> Option<DateTime<Utc>> {
        *self.last_reconcile.lock()
    }

    #[must_use]
    pub fn health(&self) -> ControllerHealth {
        ControllerHealth {
            name: self.name.clone(),
            last_poll: *self.last_poll.lock(),
            last_reconcile: self.last_reconcile(),
            heartbeat_age_ms: u64::try_from(self.heartbeat_age().as_millis()).unwrap_or(u64::MAX),
            poll_interval_ms: u64::try_from(self.poll_interval().as_millis()).unwrap_or(u64::MAX),
            restart_count: self.restart_count(),
        }
    }

    /// Run the worker pool until `token` is cancelled.
    ///
    /// A worker panic that was not recovered is resumed here right away
    /// instead of waiting for the remaining workers.
    pub async fn start(self: Arc<Self>, token: CancellationToken) {
        let workers = self.options.max_concurrent_reconciles.max(1);
        info!(controller = %self.name, workers, "starting workers");

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(Arc::clone(&self).worker(token.clone()));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    set.abort_all();
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }

        info!(controller = %self.name, "workers stopped");
    }

    /// One poll cycle. Completing it, successfully or not, counts as a heartbeat.
    pub async fn poll(&self, token: &CancellationToken) -> anyhow::Result<()> {
        let result = match AssertUnwindSafe(self.reconciler.poll(token)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) if self.options.recover_panic => Err(anyhow::anyhow!(
                "panic: {} [recovered]",
                panic_message(panic.as_ref())
            )),
            Err(panic) => {
                error!(controller = %self.name, panic = %panic_message(panic.as_ref()), "poll panicked");
                std::panic::resume_unwind(panic)
            }
        };

        self.heartbeat.beat();
        *self.last_poll.lock() = Some(Utc::now());
        result
    }

    /// Recycle the reconciler's queue and cache after a stall.
    ///
    /// An in-flight reconcile is not interrupted; its worker finishes it and
    /// then picks up the new queue.
    pub fn restart(&self) {
        self.reconciler.restart();
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.heartbeat.beat();
    }

    /// Terminal cleanup once the controller stops for good.
    pub fn shutdown(&self) {
        debug!(controller = %self.name, "shutting down reconciler");
        self.reconciler.shutdown();
    }

    async fn worker(self: Arc<Self>, token: CancellationToken) {
        loop {
            // re-read every iteration: restart swaps the queue underneath us
            let queue = self.reconciler.queue();
            let next = tokio::select! {
                () = token.cancelled() => return,
                next = queue.get() => next,
            };

            let Some(id) = next else {
                if token.is_cancelled() || Arc::ptr_eq(&queue, &self.reconciler.queue()) {
                    return;
                }
                debug!(controller = %self.name, "queue recycled, switching");
                continue;
            };

            self.process(&queue, &id, &token).await;
        }
    }

    async fn process(&self, queue: &WorkQueue, id: &str, token: &CancellationToken) {
        let ctx = ReconcileContext {
            reconcile_id: Uuid::new_v4(),
            cancel: token.child_token(),
            cache_sync_timeout: self.options.cache_sync_timeout,
        };
        let span = info_span!(
            "reconcile",
            controller = %self.name,
            id = %id,
            reconcile_id = %ctx.reconcile_id
        );

        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&ctx, id).instrument(span))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) if self.options.recover_panic => Err(anyhow::anyhow!(
                "panic: {} [recovered]",
                panic_message(panic.as_ref())
            )),
            Err(panic) => {
                error!(controller = %self.name, id = %id, panic = %panic_message(panic.as_ref()), "reconcile panicked");
                queue.done(id);
                std::panic::resume_unwind(panic)
            }
        };

        self.requeue(queue, id, result);
        *self.last_reconcile.lock() = Some(Utc::now());
        queue.done(id);
    }

    fn requeue(&self, queue: &WorkQueue, id: &str, result: anyhow::Result<ReconcileResult>) {
        match result {
            Err(e) => {
                error!(controller = %self.name, id = %id, error = %e, "reconciler error");
                queue.add_rate_limited(id);
            }
            Ok(ReconcileResult {
                requeue_after: Some(after),
                ..
            }) if !after.is_zero() => {
                debug!(controller = %self.name, id = %id, after = ?after, "requeue after");
                queue.forget(id);
                queue.add_after(id, after);
            }
            Ok(ReconcileResult { requeue: true, .. }) => {
                debug!(controller = %self.name, id = %id, "requeue with backoff");
                queue.add_rate_limited(id);
            }
            Ok(_) => {
                queue.forget(id);
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        warn!("panic payload is not a string");
        "unknown panic".to_string()
    }
}
