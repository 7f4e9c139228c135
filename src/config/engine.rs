use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

/// Reconciliation engine tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Upper bound on diff+execute passes of one apply.
    /// TOML: `engine.max_passes`. Default: `3`.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Concurrent mapper calls within one entity type.
    /// TOML: `engine.concurrency`. Default: `8`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Cloud mutations per second across one run.
    /// TOML: `engine.cloud_tps`. Default: `20`.
    #[serde(default = "default_cloud_tps")]
    pub cloud_tps: NonZeroU32,

    /// Timeout of one cloud call, retries excluded.
    /// TOML: `engine.call_timeout_secs`. Default: `60`.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// How often a running operation refreshes its heartbeat.
    /// TOML: `engine.heartbeat_interval_secs`. Default: `10`.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age after which a running operation is considered abandoned.
    /// TOML: `engine.stale_after_secs`. Default: `120`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Pull cloud state into the tables of newly installed modules.
    /// TOML: `engine.sync_on_install`. Default: `true`.
    #[serde(default = "default_sync_on_install")]
    pub sync_on_install: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_passes: default_max_passes(),
            concurrency: default_concurrency(),
            cloud_tps: default_cloud_tps(),
            call_timeout_secs: default_call_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            sync_on_install: default_sync_on_install(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Backoff applied to transient cloud failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// TOML: `retry.min_delay_ms`. Default: `200`.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// TOML: `retry.max_delay_ms`. Default: `5000`.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Max retry attempts after the first call.
    /// TOML: `retry.max_times`. Default: `3`.
    #[serde(default = "default_max_times")]
    pub max_times: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_times: default_max_times(),
        }
    }
}

fn default_max_passes() -> usize {
    3
}

fn default_concurrency() -> usize {
    8
}

fn default_cloud_tps() -> NonZeroU32 {
    NonZeroU32::new(20).unwrap_or(NonZeroU32::MIN)
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_stale_after_secs() -> u64 {
    120
}

fn default_sync_on_install() -> bool {
    true
}

fn default_min_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_max_times() -> usize {
    3
}
