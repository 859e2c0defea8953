//! # Dynamic Poll Scheduler
//!
//! Calls a poll callback on an interval that is re-read before every wait.
//! A zero interval pauses the loop: it idles in one second steps until the
//! provider returns something positive again, without tearing the loop down.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::reconciler::PollInterval;

/// Granularity of the paused state.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct DynamicPoller {
    name: String,
    interval: PollInterval,
}

impl DynamicPoller {
    pub fn new(name: impl Into<String>, interval: PollInterval) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }

    /// Poll until `token` is cancelled. Callback errors are logged and never
    /// stop the loop; an in-flight callback is dropped on cancellation.
    pub async fn run<C, Fut>(&self, token: &CancellationToken, mut callback: C)
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        info!(poller = %self.name, "starting poller");
        let mut paused = false;

        loop {
            let interval = self.interval.get();

            if interval.is_zero() {
                if !paused {
                    info!(poller = %self.name, "poll interval is 0, pausing");
                    paused = true;
                }
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(IDLE_CHECK_INTERVAL) => continue,
                }
            }

            if paused {
                info!(poller = %self.name, interval = ?interval, "resuming poller");
                paused = false;
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            debug!(poller = %self.name, "polling");
            // a poll stuck on the remote side must not hold up shutdown
            tokio::select! {
                () = token.cancelled() => break,
                result = callback() => {
                    if let Err(e) = result {
                        error!(poller = %self.name, error = %e, "poller failed");
                    }
                }
            }
        }

        info!(poller = %self.name, "poller finished");
    }

    /// Run the loop on a background task.
    ///
    /// With `sync_first_run` the callback runs once right away and its
    /// result is returned, which is the only way to observe a poll error.
    pub async fn spawn<C, Fut>(
        self,
        token: CancellationToken,
        sync_first_run: bool,
        mut callback: C,
    ) -> (anyhow::Result<()>, JoinHandle<()>)
    where
        C: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let first = if sync_first_run {
            callback().await
        } else {
            Ok(())
        };

        let handle = tokio::spawn(async move {
            self.run(&token, callback).await;
        });
        (first, handle)
    }
}
