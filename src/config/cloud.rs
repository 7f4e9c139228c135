use serde::{Deserialize, Serialize};
use url::Url;

/// Settings for the REST cloud client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// Base URL of the cloud API.
    /// TOML: `cloud.endpoint`. Default: `http://127.0.0.1:4566`.
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,

    /// Optional upstream HTTP proxy. If set, used for the reqwest client.
    /// TOML: `cloud.proxy`. Example: `http://127.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<Url>,

    /// TOML: `cloud.timeout_secs`. Default: `30`.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// TOML: `cloud.connect_timeout_secs`. Default: `10`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            proxy: None,
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_endpoint() -> Url {
    Url::parse("http://127.0.0.1:4566").expect("default endpoint is a valid url")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}
