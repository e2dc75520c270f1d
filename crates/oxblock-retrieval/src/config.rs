//! Retrieval queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default number of retrieval workers.
pub const DEFAULT_WORKERS: usize = 8;

/// How long an idle pool worker waits for work before re-checking its
/// shutdown flag.
pub const DEFAULT_WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the retrieval queue and its worker pool.
///
/// Worker count affects throughput only, never dispatch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalConfig {
    /// Number of concurrent workers the dispatch channel hands off to.
    ///
    /// Default: 8.
    pub workers: usize,

    /// Deadline applied by [`RequestContext::for_config`](crate::RequestContext::for_config).
    ///
    /// Default: none.
    #[serde(with = "humantime_serde")]
    pub default_request_timeout: Option<Duration>,

    /// Poll interval for idle pool workers.
    ///
    /// Default: 100ms.
    #[serde(with = "humantime_serde")]
    pub worker_poll_interval: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            default_request_timeout: None,
            worker_poll_interval: DEFAULT_WORKER_POLL_INTERVAL,
        }
    }
}

impl RetrievalConfig {
    /// Configuration for the given number of workers.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Sets the default request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = Some(timeout);
        self
    }

    /// Sets the idle worker poll interval.
    #[must_use]
    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}
