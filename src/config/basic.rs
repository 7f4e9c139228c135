use serde::{Deserialize, Serialize};

/// Placeholder replaced by the target name in `basic.database_url`.
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Basic (core) configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicConfig {
    /// SQLite URL template; `{target}` is replaced by the target name, giving one database per
    /// target.
    /// TOML: `basic.database_url`. Default: `sqlite://cloudrow-{target}.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Log level for tracing subscriber initialization (e.g., "error", "warn", "info", "debug", "trace").
    /// TOML: `basic.loglevel`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            loglevel: default_loglevel(),
        }
    }
}

impl BasicConfig {
    /// Database URL for one target. Templates without a placeholder are shared verbatim.
    pub fn database_url_for(&self, target: &str) -> String {
        self.database_url.replace(TARGET_PLACEHOLDER, target)
    }
}

fn default_database_url() -> String {
    "sqlite://cloudrow-{target}.db".to_string()
}

fn default_loglevel() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_is_per_target() {
        let cfg = BasicConfig::default();
        assert_eq!(cfg.database_url_for("prod"), "sqlite://cloudrow-prod.db");
    }
}
