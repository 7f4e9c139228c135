mod basic;
mod cloud;
mod engine;

pub use basic::{BasicConfig, TARGET_PLACEHOLDER};
pub use cloud::CloudConfig;
pub use engine::{EngineConfig, RetryConfig};

use crate::error::CloudrowError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Storage and logging (see `basic` table in cloudrow.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Reconciliation tuning (see `engine` table in cloudrow.toml).
    #[serde(default)]
    pub engine: EngineConfig,

    /// Backoff for transient cloud failures (see `retry` table in cloudrow.toml).
    #[serde(default)]
    pub retry: RetryConfig,

    /// REST cloud client (see `cloud` table in cloudrow.toml).
    #[serde(default)]
    pub cloud: CloudConfig,
}

pub const DEFAULT_CONFIG_FILE: &str = "cloudrow.toml";

const ENV_PREFIX: &str = "CLOUDROW_";

impl Config {
    /// Builds a Figment that merges defaults, `cloudrow.toml` if present, then `CLOUDROW_*`
    /// environment variables (`CLOUDROW_ENGINE__MAX_PASSES=5`).
    pub fn figment() -> Figment {
        Self::figment_with_file(DEFAULT_CONFIG_FILE)
    }

    pub fn figment_with_file(path: impl AsRef<Path>) -> Figment {
        let path = path.as_ref();
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if path.is_file() {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads configuration from defaults, the optional TOML file and the environment.
    pub fn load() -> Result<Self, CloudrowError> {
        Ok(Self::figment().extract()?)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, CloudrowError> {
        Ok(Self::figment_with_file(path).extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let path = std::env::temp_dir().join(format!(
            "cloudrow-config-{}.toml",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(
            &path,
            "[engine]\nmax_passes = 5\nconcurrency = 2\n\n[retry]\nmax_times = 1\n",
        )
        .expect("write config");

        let cfg = Config::load_from(&path).expect("load config");
        let _ = std::fs::remove_file(&path);

        assert_eq!(cfg.engine.max_passes, 5);
        assert_eq!(cfg.engine.concurrency, 2);
        assert_eq!(cfg.retry.max_times, 1);
        assert_eq!(cfg.retry.min_delay_ms, 200);
        assert!(cfg.engine.sync_on_install);
        assert_eq!(cfg.basic.loglevel, "info");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load_from("/nonexistent/cloudrow.toml").expect("defaults");
        assert_eq!(cfg.engine.max_passes, 3);
        assert_eq!(cfg.cloud.endpoint.as_str(), "http://127.0.0.1:4566/");
    }
}
