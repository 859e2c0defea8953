//! Agent configuration loaded from a mounted YAML file.
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration. Durations are expressed in seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::manager::ManagerBuilder;
use crate::supervisor::LivenessThreshold;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Workers per controller.
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    #[serde(default = "default_cache_sync_timeout")]
    pub cache_sync_timeout_seconds: u64,

    /// Poll cadence for reconcilers without their own.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_seconds: u64,

    /// Cache TTL for remote objects.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,

    #[serde(default)]
    pub recover_panic: bool,

    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Page size used when listing remote objects.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_check_interval")]
    pub check_interval_seconds: u64,

    /// Lower bound of the staleness deadline.
    #[serde(default)]
    pub dead_timeout_seconds: u64,

    /// Deadline as a multiple of the controller's poll interval.
    #[serde(default = "default_poll_multiplier")]
    pub poll_multiplier: u32,
}

fn default_max_concurrent_reconciles() -> usize {
    1
}

fn default_cache_sync_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    120
}

fn default_poll_jitter() -> u64 {
    15
}

fn default_refresh_interval() -> u64 {
    120
}

fn default_page_size() -> u32 {
    100
}

fn default_liveness_check_interval() -> u64 {
    30
}

fn default_poll_multiplier() -> u32 {
    5
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_liveness_check_interval(),
            dead_timeout_seconds: 0,
            poll_multiplier: default_poll_multiplier(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            cache_sync_timeout_seconds: default_cache_sync_timeout(),
            poll_interval_seconds: default_poll_interval(),
            poll_jitter_seconds: default_poll_jitter(),
            refresh_interval_seconds: default_refresh_interval(),
            recover_panic: false,
            liveness: LivenessConfig::default(),
            page_size: default_page_size(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a mounted file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&raw)?;
        debug!(path = %path.display(), "loaded agent configuration");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::Config(
                "maxConcurrentReconciles must be at least 1".to_string(),
            ));
        }
        if self.liveness.check_interval_seconds == 0 {
            return Err(Error::Config(
                "liveness.checkIntervalSeconds must be positive".to_string(),
            ));
        }
        if self.liveness.poll_multiplier == 0 {
            return Err(Error::Config(
                "liveness.pollMultiplier must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::Config("pageSize must be at least 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    #[must_use]
    pub fn liveness_threshold(&self) -> LivenessThreshold {
        LivenessThreshold {
            dead_timeout: Duration::from_secs(self.liveness.dead_timeout_seconds),
            poll_multiplier: self.liveness.poll_multiplier,
        }
    }

    /// Apply the engine settings to a manager builder.
    #[must_use]
    pub fn apply(&self, builder: ManagerBuilder) -> ManagerBuilder {
        builder
            .max_concurrent_reconciles(self.max_concurrent_reconciles)
            .cache_sync_timeout(Duration::from_secs(self.cache_sync_timeout_seconds))
            .poll_interval(Duration::from_secs(self.poll_interval_seconds))
            .poll_jitter(Duration::from_secs(self.poll_jitter_seconds))
            .recover_panic(self.recover_panic)
            .liveness_check_interval(Duration::from_secs(self.liveness.check_interval_seconds))
            .liveness_threshold(self.liveness_threshold())
    }
}
