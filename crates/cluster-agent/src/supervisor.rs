//! # Heartbeat Supervisor
//!
//! Process-wide watchdog. On a fixed interval it compares every controller's
//! heartbeat age with its liveness deadline and recycles the queue and cache
//! of any controller that went stale. In-flight reconciles are never
//! interrupted: the rest of the keyspace keeps moving while one key is stuck.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::controller::Controller;

/// How stale a heartbeat may get before the controller is restarted.
///
/// The deadline is `max(dead_timeout, poll_multiplier × poll interval)`,
/// evaluated against the controller's current interval on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessThreshold {
    pub dead_timeout: Duration,
    pub poll_multiplier: u32,
}

impl Default for LivenessThreshold {
    fn default() -> Self {
        Self {
            dead_timeout: Duration::ZERO,
            poll_multiplier: 5,
        }
    }
}

impl LivenessThreshold {
    /// `None` while polling is paused: a paused poller has no heartbeat to judge.
    #[must_use]
    pub fn deadline(&self, poll_interval: Duration) -> Option<Duration> {
        if poll_interval.is_zero() {
            return None;
        }
        let scaled = poll_interval.saturating_mul(self.poll_multiplier.max(1));
        Some(scaled.max(self.dead_timeout))
    }
}

pub struct Supervisor {
    check_interval: Duration,
    threshold: LivenessThreshold,
    controllers: Vec<Arc<Controller>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(check_interval: Duration, threshold: LivenessThreshold) -> Self {
        Self {
            check_interval,
            threshold,
            controllers: Vec::new(),
        }
    }

    pub fn watch(&mut self, controller: Arc<Controller>) {
        self.controllers.push(controller);
    }

    /// One liveness pass. Returns how many controllers were restarted.
    pub fn check(&self) -> usize {
        let mut restarted = 0;

        for controller in &self.controllers {
            let interval = controller.poll_interval();
            let Some(deadline) = self.threshold.deadline(interval) else {
                debug!(controller = %controller.name(), "poll interval is 0, skipping liveness check");
                continue;
            };

            let age = controller.heartbeat_age();
            if age <= deadline {
                continue;
            }

            warn!(
                controller = %controller.name(),
                heartbeat_age = ?age,
                deadline = ?deadline,
                "controller unresponsive, restarting"
            );
            controller.restart();
            restarted += 1;
        }

        restarted
    }

    #[instrument(skip_all, fields(controllers = self.controllers.len()))]
    pub async fn run(self, token: CancellationToken) {
        info!(interval = ?self.check_interval, "starting supervisor");
        let mut ticker = tokio::time::interval(self.check_interval);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.check();
                }
            }
        }

        info!("supervisor stopped");
    }
}
