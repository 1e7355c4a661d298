use std::time::Duration;

use serde::Deserialize;

fn default_workers() -> usize {
    4
}
fn default_resync_interval_secs() -> u64 {
    300
}
fn default_backoff_base_ms() -> u64 {
    5
}
fn default_backoff_max_secs() -> u64 {
    1000
}
fn default_cache_sync_timeout_secs() -> u64 {
    60
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

/// Process level settings, read once at startup.
#[derive(Deserialize, Clone, Debug)]
pub struct OperatorConfig {
    /// Number of concurrent reconciliation workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Interval at which every cached Environment is requeued (0 disables)
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Retry delay after the first failure of a key
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound of the per-key retry delay
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// How long startup waits for every watched kind to finish its initial list
    #[serde(default = "default_cache_sync_timeout_secs")]
    pub cache_sync_timeout_secs: u64,
    /// Deadline applied to every create/patch/delete against the apiserver
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl OperatorConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ENVOP_").from_env()
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            cache_sync_timeout_secs: default_cache_sync_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            metrics_addr: default_metrics_addr(),
        }
    }
}
