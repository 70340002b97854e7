//! Configuration module for the Fantasy REST client.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest interval any sweeper may be configured with (4 hours).
pub const MAX_SWEEP_INTERVAL_MS: u64 = 4 * 60 * 60 * 1000;

/// Sweep interval that disables a sweeper, same as `0`.
pub const SWEEPER_DISABLED: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for the REST client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub rate_limiting: RateLimitingConfig,
    pub sweepers: SweeperConfig,
    pub logging: LoggingConfig,
}

/// Remote API location and request decoration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the API, without the version segment.
    pub base_url: String,
    /// API version inserted as `/v{version}` for versioned requests.
    pub version: String,
    /// Prefix of the `Authorization` header, e.g. `Bot`.
    pub auth_prefix: String,
    /// Appended to the default `User-Agent`.
    pub user_agent_appendix: String,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

/// Rate limiting and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// API-wide request budget per one-second window.
    pub global_requests_per_second: u32,
    /// Milliseconds added to every computed reset time.
    pub offset_ms: u64,
    /// Retries allowed for transient transport failures and 5xx responses.
    pub retries: u32,
    /// Retries allowed after 429 responses. `None` retries until the request succeeds.
    pub rate_limit_retries: Option<u32>,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Bucket route prefixes for which a rate limit is surfaced as an error
    /// instead of being waited out.
    pub reject_on_rate_limit: Vec<String>,
    /// Emit an invalid-request warning every this many 401/403/429 responses.
    /// `0` disables the warning.
    pub invalid_request_warning_interval: u32,
}

/// Background sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Milliseconds between bucket hash sweeps. `0` or `u64::MAX` disables the sweeper.
    pub hash_sweep_interval_ms: u64,
    /// Milliseconds a bucket hash may go unused before it is swept.
    pub hash_lifetime_ms: u64,
    /// Milliseconds between idle handler sweeps. `0` or `u64::MAX` disables the sweeper.
    pub handler_sweep_interval_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load configuration, using defaults");
                Self::default()
            }
        }
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/fantasy/rest.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("fantasy")
            .join("rest.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.rmtid.xyz".to_string(),
            version: "1".to_string(),
            auth_prefix: "Bot".to_string(),
            user_agent_appendix: String::new(),
            headers: BTreeMap::new(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            global_requests_per_second: 50,
            offset_ms: 50,
            retries: 3,
            rate_limit_retries: None,
            timeout_ms: 15_000,
            reject_on_rate_limit: Vec::new(),
            invalid_request_warning_interval: 0,
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            hash_sweep_interval_ms: MAX_SWEEP_INTERVAL_MS,
            hash_lifetime_ms: 24 * 60 * 60 * 1000,
            handler_sweep_interval_ms: 60 * 60 * 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"rate_limiting.timeout_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- api ---
        if self.api.base_url.is_empty() {
            errors.push(ValidationError {
                field: "api.base_url".into(),
                message: "must not be empty".into(),
            });
        }
        if self.api.auth_prefix.trim().is_empty() {
            errors.push(ValidationError {
                field: "api.auth_prefix".into(),
                message: "must not be empty".into(),
            });
        }

        // --- rate_limiting ---
        if self.rate_limiting.global_requests_per_second == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.global_requests_per_second".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.rate_limiting.timeout_ms == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.timeout_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- sweepers ---
        for (field, value) in [
            (
                "sweepers.hash_sweep_interval_ms",
                self.sweepers.hash_sweep_interval_ms,
            ),
            (
                "sweepers.handler_sweep_interval_ms",
                self.sweepers.handler_sweep_interval_ms,
            ),
        ] {
            if value != SWEEPER_DISABLED && value > MAX_SWEEP_INTERVAL_MS {
                errors.push(ValidationError {
                    field: field.into(),
                    message: format!(
                        "cannot be greater than 4 hours ({} ms), got {}",
                        MAX_SWEEP_INTERVAL_MS, value
                    ),
                });
            }
        }
        if self.sweepers.hash_lifetime_ms == 0 {
            errors.push(ValidationError {
                field: "sweepers.hash_lifetime_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust
/// use fantasy_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .api_base_url("http://localhost:4976")
///     .rate_limiting_global_requests_per_second(10)
///     .logging_level("debug")
///     .build();
/// assert_eq!(config.rate_limiting.global_requests_per_second, 10);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- api ---

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api.base_url = url.into();
        self
    }

    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api.version = version.into();
        self
    }

    pub fn api_auth_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.api.auth_prefix = prefix.into();
        self
    }

    pub fn api_user_agent_appendix(mut self, appendix: impl Into<String>) -> Self {
        self.config.api.user_agent_appendix = appendix.into();
        self
    }

    pub fn api_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.api.headers.insert(name.into(), value.into());
        self
    }

    // --- rate_limiting ---

    pub fn rate_limiting_global_requests_per_second(mut self, n: u32) -> Self {
        self.config.rate_limiting.global_requests_per_second = n;
        self
    }

    pub fn rate_limiting_offset_ms(mut self, ms: u64) -> Self {
        self.config.rate_limiting.offset_ms = ms;
        self
    }

    pub fn rate_limiting_retries(mut self, n: u32) -> Self {
        self.config.rate_limiting.retries = n;
        self
    }

    pub fn rate_limiting_rate_limit_retries(mut self, n: Option<u32>) -> Self {
        self.config.rate_limiting.rate_limit_retries = n;
        self
    }

    pub fn rate_limiting_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rate_limiting.timeout_ms = ms;
        self
    }

    pub fn rate_limiting_reject_on_rate_limit(mut self, prefixes: Vec<String>) -> Self {
        self.config.rate_limiting.reject_on_rate_limit = prefixes;
        self
    }

    pub fn rate_limiting_invalid_request_warning_interval(mut self, n: u32) -> Self {
        self.config.rate_limiting.invalid_request_warning_interval = n;
        self
    }

    // --- sweepers ---

    pub fn sweepers_hash_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.sweepers.hash_sweep_interval_ms = ms;
        self
    }

    pub fn sweepers_hash_lifetime_ms(mut self, ms: u64) -> Self {
        self.config.sweepers.hash_lifetime_ms = ms;
        self
    }

    pub fn sweepers_handler_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.sweepers.handler_sweep_interval_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
