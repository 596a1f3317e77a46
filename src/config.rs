//! Configuration management for Tollgate.
//!
//! Configuration is read once at start-up from an optional YAML file and then
//! from `TOLLGATE__`-prefixed environment variables, with `__` separating
//! nested keys (`TOLLGATE__RATE_LIMITING__API__MAX_REQUESTS=50`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Quota;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Caller identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path prefix of the API surface
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Quota for requests under `api_prefix`
    #[serde(default = "default_api_quota")]
    pub api: QuotaConfig,

    /// Quota for all other requests
    #[serde(default = "default_web_quota")]
    pub web: QuotaConfig,

    /// Window lengths an expired record is kept before cleanup removes it
    #[serde(default = "default_grace_multiplier")]
    pub grace_multiplier: u64,

    /// Interval of the background cleanup task in seconds (0 disables it)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            api: default_api_quota(),
            web: default_web_quota(),
            grace_multiplier: default_grace_multiplier(),
            cleanup_interval_secs: default_cleanup_interval(),
            store: StoreConfig::default(),
        }
    }
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_api_quota() -> QuotaConfig {
    QuotaConfig::default()
}

fn default_web_quota() -> QuotaConfig {
    QuotaConfig {
        enabled: false,
        ..QuotaConfig::default()
    }
}

fn default_grace_multiplier() -> u64 {
    1
}

fn default_cleanup_interval() -> u64 {
    300
}

/// Requests-per-window policy for one traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Whether this traffic class is rate limited at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl QuotaConfig {
    /// Validate into a [`Quota`].
    pub fn quota(&self) -> Result<Quota> {
        Quota::new(self.max_requests, self.window_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map; counters reset on restart
    Memory,
    /// One file per identifier under `path`
    File,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Root directory of the file store; each policy gets a subdirectory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Upper bound on one store operation in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            timeout_ms: default_store_timeout(),
        }
    }
}

impl StoreConfig {
    /// The store operation bound as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./var/ratelimit")
}

fn default_store_timeout() -> u64 {
    250
}

/// How far proxy-supplied address headers are trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Header injected by the edge (e.g. `CF-Connecting-IP`) and trusted
    /// above all other address sources. Unset means no such header exists.
    #[serde(default)]
    pub trusted_edge_header: Option<String>,

    /// Honor `X-Forwarded-For` and `X-Real-IP`
    #[serde(default = "default_true")]
    pub trust_forwarded_headers: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trusted_edge_header: None,
            trust_forwarded_headers: true,
        }
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string (no environment overrides).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        if !limits.api_prefix.starts_with('/') {
            return Err(TollgateError::Config(format!(
                "api_prefix must start with '/': {:?}",
                limits.api_prefix
            )));
        }
        for (name, quota) in [("api", &limits.api), ("web", &limits.web)] {
            if quota.enabled {
                quota.quota().map_err(|e| {
                    TollgateError::Config(format!("rate_limiting.{}: {}", name, e))
                })?;
            }
        }
        if limits.store.timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
