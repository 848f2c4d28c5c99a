//! Configuration management for the rate limiter.
//!
//! Settings are layered with the `config` crate: an optional YAML file, then
//! `RATELIMIT_`-prefixed environment variables, then the REST store
//! credentials under their conventional Upstash names.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// Environment variable holding the REST store base URL.
pub const STORE_URL_ENV: &str = "UPSTASH_REDIS_REST_URL";
/// Environment variable holding the REST store access token.
pub const STORE_TOKEN_ENV: &str = "UPSTASH_REDIS_REST_TOKEN";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Global namespace every rate limit key lives under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Remote key-value store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// In-memory fallback configuration
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            store: StoreConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "ratelimit".to_string()
}

/// Remote REST key-value store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the REST endpoint (the pipeline lives at `<url>/pipeline`)
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for the REST endpoint
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    /// Both the URL and the token are present and non-blank.
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.url) && present(&self.token)
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout() -> u64 {
    5000
}

/// In-memory fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// How often expired entries are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl MemoryConfig {
    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl ServiceConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("RATELIMIT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("store.url", std::env::var(STORE_URL_ENV).ok())?
            .set_override_option("store.token", std::env::var(STORE_TOKEN_ENV).ok())?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RateLimitError::Config(e.to_string()))
    }
}
