//! # Controller Manager
//!
//! Composition root of the engine. Reconcilers are registered first; a single
//! `start` then launches, per reconciler, its worker pool and poll loop, one
//! supervisor watching all of them and the socket join loop. Everything
//! shares one cancellation token, which is the only shutdown signal. An
//! unrecovered panic in any of those tasks cancels it and is re-raised by
//! [`Manager::wait`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ConsoleArgs, ConsoleClient};
use crate::controller::{panic_message, Controller, ControllerHealth, ControllerOptions};
use crate::error::{Error, Result};
use crate::poller::DynamicPoller;
use crate::reconciler::{PollInterval, Reconciler};
use crate::socket::{PhoenixSocket, Socket, SocketArgs};
use crate::supervisor::{LivenessThreshold, Supervisor};

pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 1;
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(15);
pub const DEFAULT_LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Engine-wide settings handed to every controller.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub max_concurrent_reconciles: usize,
    pub cache_sync_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub recover_panic: bool,
    pub liveness_check_interval: Duration,
    pub liveness_threshold: LivenessThreshold,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_jitter: DEFAULT_POLL_JITTER,
            recover_panic: false,
            liveness_check_interval: DEFAULT_LIVENESS_CHECK_INTERVAL,
            liveness_threshold: LivenessThreshold::default(),
        }
    }
}

/// Builder for [`Manager`]. A socket (instance or args) is required; each
/// instance/args pair is mutually exclusive.
#[derive(Default)]
pub struct ManagerBuilder {
    options: ManagerOptions,
    console_client: Option<ConsoleClient>,
    console_args: Option<ConsoleArgs>,
    socket: Option<Arc<dyn Socket>>,
    socket_args: Option<SocketArgs>,
}

impl ManagerBuilder {
    #[must_use]
    pub fn max_concurrent_reconciles(mut self, workers: usize) -> Self {
        self.options.max_concurrent_reconciles = workers;
        self
    }

    #[must_use]
    pub fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.options.cache_sync_timeout = timeout;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.options.poll_jitter = jitter;
        self
    }

    #[must_use]
    pub fn recover_panic(mut self, recover: bool) -> Self {
        self.options.recover_panic = recover;
        self
    }

    #[must_use]
    pub fn liveness_check_interval(mut self, interval: Duration) -> Self {
        self.options.liveness_check_interval = interval;
        self
    }

    #[must_use]
    pub fn liveness_threshold(mut self, threshold: LivenessThreshold) -> Self {
        self.options.liveness_threshold = threshold;
        self
    }

    #[must_use]
    pub fn console_client(mut self, client: ConsoleClient) -> Self {
        self.console_client = Some(client);
        self
    }

    #[must_use]
    pub fn console_client_args(mut self, url: impl Into<String>, deploy_token: impl Into<String>) -> Self {
        self.console_args = Some(ConsoleArgs {
            url: url.into(),
            deploy_token: deploy_token.into(),
        });
        self
    }

    #[must_use]
    pub fn socket(mut self, socket: Arc<dyn Socket>) -> Self {
        self.socket = Some(socket);
        self
    }

    #[must_use]
    pub fn socket_args(
        mut self,
        cluster_id: impl Into<String>,
        console_url: impl Into<String>,
        deploy_token: impl Into<String>,
    ) -> Self {
        self.socket_args = Some(SocketArgs {
            cluster_id: cluster_id.into(),
            console_url: console_url.into(),
            deploy_token: deploy_token.into(),
        });
        self
    }

    /// Validate the options and connect what was given as args.
    ///
    /// Socket args spawn the connection task, so this must run inside a
    /// Tokio runtime when they are used.
    pub fn build(self) -> Result<Manager> {
        if self.console_client.is_some() && self.console_args.is_some() {
            return Err(Error::MutuallyExclusive("console_client", "console_client_args"));
        }
        if self.socket.is_some() && self.socket_args.is_some() {
            return Err(Error::MutuallyExclusive("socket", "socket_args"));
        }

        let client = match (self.console_client, self.console_args) {
            (Some(client), _) => Some(client),
            (None, Some(args)) => Some(ConsoleClient::from_args(&args)?),
            (None, None) => None,
        };

        let socket: Arc<dyn Socket> = match (self.socket, self.socket_args) {
            (Some(socket), _) => socket,
            (None, Some(args)) => Arc::new(PhoenixSocket::connect(&args)?),
            (None, None) => {
                return Err(Error::Config("a socket or socket args must be provided".to_string()))
            }
        };

        Ok(Manager {
            options: self.options,
            client,
            socket,
            registrations: RwLock::new(Vec::new()),
            started: Mutex::new(false),
            tasks: Mutex::new(Vec::new()),
            fault: Arc::new(Mutex::new(None)),
        })
    }
}

struct Registration {
    controller: Arc<Controller>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Owns every controller, the console client and the push socket.
pub struct Manager {
    options: ManagerOptions,
    client: Option<ConsoleClient>,
    socket: Arc<dyn Socket>,
    registrations: RwLock<Vec<Registration>>,
    started: Mutex<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // first unrecovered panic, re-raised by wait
    fault: Arc<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl Manager {
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    #[must_use]
    pub fn client(&self) -> Option<&ConsoleClient> {
        self.client.as_ref()
    }

    #[must_use]
    pub fn socket(&self) -> Arc<dyn Socket> {
        Arc::clone(&self.socket)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }

    /// `true` once a task died of a panic that was not recovered.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    /// Build a reconciler with `factory` and register it under `name`.
    pub fn add_reconciler<R, F>(&self, name: &str, factory: F) -> Result<Arc<R>>
    where
        R: Reconciler,
        F: FnOnce() -> anyhow::Result<R>,
    {
        let reconciler = factory().map_err(|source| Error::ReconcilerConstruction {
            name: name.to_string(),
            source,
        })?;
        self.register(name, Arc::new(reconciler))
    }

    /// Like [`Manager::add_reconciler`], but a wiring failure exits the process.
    pub fn add_reconciler_or_die<R, F>(&self, name: &str, factory: F) -> Arc<R>
    where
        R: Reconciler,
        F: FnOnce() -> anyhow::Result<R>,
    {
        match self.add_reconciler(name, factory) {
            Ok(reconciler) => reconciler,
            Err(e) => {
                error!(name = %name, error = %e, "unable to create reconciler");
                std::process::exit(1);
            }
        }
    }

    /// Register an already built reconciler: its publisher is wired into the
    /// socket and a controller is created for it.
    pub fn register<R: Reconciler>(&self, name: &str, reconciler: Arc<R>) -> Result<Arc<R>> {
        // held for the whole registration so start cannot interleave
        let started = self.started.lock();
        if *started {
            return Err(Error::WiringAfterStart {
                name: name.to_string(),
            });
        }

        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.controller.name() == name) {
            return Err(Error::DuplicateReconciler {
                name: name.to_string(),
            });
        }

        let (event, publisher) = reconciler.publisher();
        self.socket.add_publisher(&event, publisher);

        let poll_interval = reconciler
            .poll_interval()
            .unwrap_or_else(|| PollInterval::Static(self.options.poll_interval + jitter(self.options.poll_jitter)));
        debug!(name = %name, event = %event, poll_interval = ?poll_interval, "registering reconciler");

        let dynamic: Arc<dyn Reconciler> = reconciler.clone();
        let controller = Controller::new(
            name,
            dynamic,
            ControllerOptions {
                max_concurrent_reconciles: self.options.max_concurrent_reconciles,
                cache_sync_timeout: self.options.cache_sync_timeout,
                recover_panic: self.options.recover_panic,
                poll_interval,
            },
        );

        let typed: Arc<dyn Any + Send + Sync> = reconciler.clone();
        registrations.push(Registration {
            controller: Arc::new(controller),
            typed,
        });
        Ok(reconciler)
    }

    /// Typed lookup of a registered reconciler.
    pub fn try_reconciler<R: Reconciler>(&self, name: &str) -> Result<Arc<R>> {
        let registrations = self.registrations.read();
        let registration = registrations
            .iter()
            .find(|r| r.controller.name() == name)
            .ok_or_else(|| Error::ReconcilerNotFound(name.to_string()))?;

        Arc::clone(&registration.typed)
            .downcast::<R>()
            .map_err(|_| Error::ReconcilerTypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<R>(),
            })
    }

    /// Typed lookup for cross-domain callers. An unknown name or wrong type
    /// is a wiring bug and exits the process.
    pub fn reconciler_or_die<R: Reconciler>(&self, name: &str) -> Arc<R> {
        match self.try_reconciler(name) {
            Ok(reconciler) => reconciler,
            Err(e) => {
                error!(name = %name, error = %e, "reconciler lookup failed");
                std::process::exit(1);
            }
        }
    }

    #[must_use]
    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        self.registrations
            .read()
            .iter()
            .map(|r| Arc::clone(&r.controller))
            .collect()
    }

    #[must_use]
    pub fn health(&self) -> Vec<ControllerHealth> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.controller.health())
            .collect()
    }

    /// Launch everything. Returns immediately; a second call fails with
    /// [`Error::AlreadyStarted`] and spawns nothing.
    pub fn start(&self, token: CancellationToken) -> Result<()> {
        let mut started = self.started.lock();
        if *started {
            return Err(Error::AlreadyStarted);
        }

        let registrations = self.registrations.read();
        let mut supervisor = Supervisor::new(
            self.options.liveness_check_interval,
            self.options.liveness_threshold,
        );
        let mut tasks = Vec::with_capacity(registrations.len() * 2 + 2);

        for registration in registrations.iter() {
            let controller = Arc::clone(&registration.controller);
            info!(controller = %controller.name(), "starting controller");
            supervisor.watch(Arc::clone(&controller));
            let name = controller.name().to_string();
            tasks.push(self.spawn_fail_fast(
                format!("{name} workers"),
                Arc::clone(&controller).start(token.clone()),
                &token,
            ));
            tasks.push(self.spawn_fail_fast(
                format!("{name} poller"),
                run_poller(controller, token.clone()),
                &token,
            ));
        }

        tasks.push(self.spawn_fail_fast("supervisor".to_string(), supervisor.run(token.clone()), &token));
        tasks.push(self.spawn_fail_fast(
            "socket join".to_string(),
            run_socket_join(Arc::clone(&self.socket), self.options.poll_interval, token.clone()),
            &token,
        ));

        *started = true;
        self.tasks.lock().extend(tasks);
        info!(controllers = registrations.len(), "controller manager started");
        Ok(())
    }

    /// Wait for every task spawned by `start` to finish, which happens once
    /// the token is cancelled. An unrecovered panic is resumed here.
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!("waiting for all controllers to finish");

        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                warn!(error = %e, "manager task was cancelled");
            }
        }

        let fault = self.fault.lock().take();
        if let Some(panic) = fault {
            std::panic::resume_unwind(panic);
        }
        info!("all controllers finished");
    }

    /// Spawn a manager task whose unrecovered panic stops the whole manager:
    /// the panic is kept for [`Manager::wait`] and `token` is cancelled.
    fn spawn_fail_fast<F>(&self, task: String, future: F, token: &CancellationToken) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fault = Arc::clone(&self.fault);
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
                error!(
                    task = %task,
                    panic = %panic_message(panic.as_ref()),
                    "unrecovered panic, stopping controller manager"
                );
                fault.lock().get_or_insert(panic);
                token.cancel();
            }
        })
    }
}

/// Spread controllers without a custom cadence so they do not hit the API together.
fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

async fn run_poller(controller: Arc<Controller>, token: CancellationToken) {
    let poller = DynamicPoller::new(controller.name(), controller.poll_interval_provider());
    poller
        .run(&token, || {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            async move { controller.poll(&token).await }
        })
        .await;

    controller.shutdown();
    info!(controller = %controller.name(), "controller poller finished");
}

async fn run_socket_join(socket: Arc<dyn Socket>, interval: Duration, token: CancellationToken) {
    let poller = DynamicPoller::new("socket", PollInterval::Static(interval));
    poller
        .run(&token, || {
            let socket = Arc::clone(&socket);
            async move { socket.join().await }
        })
        .await;
}
