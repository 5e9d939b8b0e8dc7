//! Configuration types and loading logic.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use spray_tracing::TracingConfig;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Upper bound on the buffered size of an inbound request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Backend set and delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    /// Initial backend set. Duplicates are ignored.
    #[serde(default)]
    pub urls: Vec<String>,

    /// Per-backend delivery timeout, covering send and response body.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Whether `POST`/`DELETE /backends` may mutate the set at runtime.
    #[serde(default)]
    pub enable_dynamic: bool,

    /// Accept invalid TLS certificates from backends.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            timeout_secs: default_timeout(),
            enable_dynamic: false,
            insecure_skip_tls_verify: false,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (SPRAY_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: ProxyConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("SPRAY_").split("__"))
            .extract()?;

        Ok(config)
    }
}
