#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_agent::socket::PublisherRegistry;
use cluster_agent::{
    Cache, Manager, PollInterval, Publisher, QueuePublisher, ReconcileContext, ReconcileResult, Reconciler,
    ReconcilerState, Socket, WorkQueue,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// In-memory socket: publishers are registered like the real one and events
/// are injected with [`FakeSocket::push`].
#[derive(Default)]
pub struct FakeSocket {
    registry: PublisherRegistry,
    pub joins: AtomicUsize,
}

impl FakeSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: &str, id: &str, force: bool) -> bool {
        self.registry.dispatch(event, id, force)
    }

    pub fn publishers(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl Socket for FakeSocket {
    fn add_publisher(&self, event: &str, publisher: Arc<dyn Publisher>) {
        self.registry.register(event, publisher);
    }

    async fn join(&self) -> anyhow::Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type PollHook = Box<dyn Fn(usize) + Send + Sync>;
type DelayHook = Box<dyn Fn(usize) -> Option<Duration> + Send + Sync>;

/// Configurable reconciler counting what the engine asks of it.
pub struct CountingReconciler {
    pub state: Arc<ReconcilerState<String>>,
    pub ids: Vec<String>,
    pub event: String,
    pub interval: Option<PollInterval>,
    pub polls: AtomicUsize,
    pub reconciles: AtomicUsize,
    pub restarts: AtomicUsize,
    pub fetches: Arc<AtomicUsize>,
    pub seen: Mutex<Vec<(String, String)>>,
    pub overlaps: AtomicUsize,
    in_flight: Mutex<HashSet<String>>,
    poll_hook: Option<PollHook>,
    poll_delay: Option<DelayHook>,
    reconcile_hook: Option<DelayHook>,
    panic_reconcile_on: Option<usize>,
    blocked: Option<(String, Duration)>,
    blocked_once: AtomicBool,
}

impl CountingReconciler {
    pub fn new(event: &str, ids: &[&str]) -> Self {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let cache = Cache::new(Duration::from_secs(3600), move |id: String| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                anyhow::Ok(format!("{id}@{n}"))
            }
        });

        Self {
            state: Arc::new(ReconcilerState::new(cache)),
            ids: ids.iter().map(ToString::to_string).collect(),
            event: event.to_string(),
            interval: None,
            polls: AtomicUsize::new(0),
            reconciles: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            fetches,
            seen: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
            in_flight: Mutex::new(HashSet::new()),
            poll_hook: None,
            poll_delay: None,
            reconcile_hook: None,
            panic_reconcile_on: None,
            blocked: None,
            blocked_once: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, interval: impl Into<PollInterval>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    /// Called with the 1-based poll number before enqueueing; may panic.
    pub fn on_poll(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.poll_hook = Some(Box::new(hook));
        self
    }

    /// Sleep returned by `delay` for the given 1-based poll number.
    pub fn poll_delay(mut self, delay: impl Fn(usize) -> Option<Duration> + Send + Sync + 'static) -> Self {
        self.poll_delay = Some(Box::new(delay));
        self
    }

    /// Sleep returned by `delay` for the given 1-based reconcile number.
    pub fn reconcile_delay(mut self, delay: impl Fn(usize) -> Option<Duration> + Send + Sync + 'static) -> Self {
        self.reconcile_hook = Some(Box::new(delay));
        self
    }

    /// The first reconcile of `id` sleeps for `delay`.
    pub fn block_key(mut self, id: &str, delay: Duration) -> Self {
        self.blocked = Some((id.to_string(), delay));
        self
    }

    /// Completed reconciles of `id`.
    pub fn reconciled(&self, id: &str) -> usize {
        self.seen.lock().iter().filter(|(seen, _)| seen == id).count()
    }

    pub fn panic_on_reconcile(mut self, n: usize) -> Self {
        self.panic_reconcile_on = Some(n);
        self
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn reconciles(&self) -> usize {
        self.reconciles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reconciler for CountingReconciler {
    async fn reconcile(&self, _ctx: &ReconcileContext, id: &str) -> anyhow::Result<ReconcileResult> {
        let n = self.reconciles.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.in_flight.lock().insert(id.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let value = self.state.cache().get(id).await;

        if let Some(delay) = self.reconcile_hook.as_ref().and_then(|hook| hook(n)) {
            tokio::time::sleep(delay).await;
        }
        if let Some((key, delay)) = &self.blocked {
            if key == id && !self.blocked_once.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(*delay).await;
            }
        }

        self.in_flight.lock().remove(id);
        if self.panic_reconcile_on == Some(n) {
            panic!("reconcile {n} blew up");
        }

        let value = value?;
        self.seen.lock().push((id.to_string(), value.to_string()));
        Ok(ReconcileResult::done())
    }

    async fn poll(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.poll_hook {
            hook(n);
        }
        if let Some(delay) = self.poll_delay.as_ref().and_then(|delay| delay(n)) {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }

        let queue = self.state.queue();
        for id in &self.ids {
            queue.add(id);
        }
        Ok(())
    }

    fn queue(&self) -> Arc<WorkQueue> {
        self.state.queue()
    }

    fn publisher(&self) -> (String, Arc<dyn Publisher>) {
        (self.event.clone(), Arc::new(QueuePublisher::new(&self.state)))
    }

    fn poll_interval(&self) -> Option<PollInterval> {
        self.interval.clone()
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.state.recycle();
    }

    fn shutdown(&self) {
        self.state.shutdown();
    }
}

/// Manager wired to `socket` with jitter disabled.
pub fn manager(socket: Arc<FakeSocket>) -> Manager {
    Manager::builder()
        .socket(socket)
        .poll_jitter(Duration::ZERO)
        .build()
        .unwrap()
}

/// Start `manager`, let it run for `window`, then shut it down.
pub async fn run_for(manager: &Manager, window: Duration) {
    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();
    tokio::time::sleep(window).await;
    token.cancel();
    manager.wait().await;
}
