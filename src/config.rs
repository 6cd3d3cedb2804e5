//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{DegradePolicy, LimitDimension, DEFAULT_NAMESPACE};

/// Prefix of environment variables overriding file settings.
///
/// Nesting uses `__`, e.g. `FLOODGATE__RATE_LIMITING__DEGRADE=fail_closed`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    pub rate_limiting: RateLimitingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Turn all admission checks on or off
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Key prefix in the counter store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Rules reload interval in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Counter store for globally scoped rules
    #[serde(default)]
    pub store: StoreConfig,

    /// Decision taken when the counter store fails; there is no default
    pub degrade: DegradePolicy,

    /// Concurrent connections per instance (0 = unlimited)
    #[serde(default)]
    pub max_connections: u64,

    /// Limiters unused for this many seconds are dropped
    #[serde(default = "default_limiter_idle")]
    pub limiter_idle_secs: u64,

    /// Dimensions checked before authentication, in order
    #[serde(default = "default_non_user_dimensions")]
    pub non_user_dimensions: Vec<LimitDimension>,

    /// Dimensions checked after authentication, in order
    #[serde(default = "default_user_dimensions")]
    pub user_dimensions: Vec<LimitDimension>,

    /// Dimensions charged per transferred chunk, in order
    #[serde(default = "default_transfer_dimensions")]
    pub transfer_dimensions: Vec<LimitDimension>,

    /// Deny-by-default gate
    #[serde(default)]
    pub whitelist: Option<WhitelistConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_limiter_idle() -> u64 {
    600
}

fn default_non_user_dimensions() -> Vec<LimitDimension> {
    vec![LimitDimension::Url, LimitDimension::UrlRepo, LimitDimension::UploadUsage]
}

fn default_user_dimensions() -> Vec<LimitDimension> {
    vec![LimitDimension::UserUrl, LimitDimension::UserUrlRepo]
}

fn default_transfer_dimensions() -> Vec<LimitDimension> {
    vec![
        LimitDimension::DownloadUsage,
        LimitDimension::UploadBandwidth,
        LimitDimension::DownloadBandwidth,
    ]
}

/// Which store backs globally scoped rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process counters; global rules behave like local ones
    #[default]
    Local,
    /// A Redis server shared by all instances
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Bound on one counter store round trip, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Local,
            redis_url: None,
            timeout_ms: default_store_timeout(),
        }
    }
}

fn default_store_timeout() -> u64 {
    200
}

/// Whitelist gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Dimensions the gate guards
    #[serde(default)]
    pub dimensions: Vec<LimitDimension>,

    /// Whitelisted resources, users or resource prefixes
    #[serde(default)]
    pub entries: Vec<String>,
}

impl RateLimitingConfig {
    /// Create a configuration with defaults and the given degrade policy.
    pub fn new(degrade: DegradePolicy) -> Self {
        Self {
            enabled: default_enabled(),
            namespace: default_namespace(),
            rules_path: None,
            refresh_interval_secs: default_refresh_interval(),
            store: StoreConfig::default(),
            degrade,
            max_connections: 0,
            limiter_idle_secs: default_limiter_idle(),
            non_user_dimensions: default_non_user_dimensions(),
            user_dimensions: default_user_dimensions(),
            transfer_dimensions: default_transfer_dimensions(),
            whitelist: None,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn limiter_idle(&self) -> Duration {
        Duration::from_secs(self.limiter_idle_secs)
    }

    /// Check the dimension lists and the store settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if let Some(dimension) = self.non_user_dimensions.iter().find(|d| d.is_user_scoped()) {
            return Err(FloodgateError::Config(format!(
                "{} needs an authenticated user and cannot run before authentication",
                dimension
            )));
        }
        if let Some(dimension) = self.user_dimensions.iter().find(|d| !d.is_user_scoped()) {
            return Err(FloodgateError::Config(format!(
                "{} is not user scoped; list it under non_user_dimensions",
                dimension
            )));
        }

        let mut seen = HashSet::new();
        let all = self
            .non_user_dimensions
            .iter()
            .chain(&self.user_dimensions)
            .chain(&self.transfer_dimensions);
        for dimension in all {
            if !seen.insert(*dimension) {
                return Err(FloodgateError::Config(format!(
                    "dimension {} is listed more than once",
                    dimension
                )));
            }
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(FloodgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.refresh_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "refresh_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl FloodgateConfig {
    /// Load configuration from a file path, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: FloodgateConfig = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}
