//! Runtime options for the request manager
//!
//! [`RestOptions`] wraps the serialisable [`Config`] and adds the two hooks
//! that can only be expressed in code: a per-route rate-limit offset and a
//! reject-on-rate-limit predicate.

use std::{fmt, sync::Arc, time::Duration};

use fantasy_core::config::{Config, SWEEPER_DISABLED};
use fantasy_core::domain::RateLimitData;

use crate::RestError;

/// Extra time added to every computed reset.
#[derive(Clone)]
pub enum RateLimitOffset {
    /// The same offset for every route
    Fixed(Duration),
    /// An offset computed from the bucket route
    PerRoute(Arc<dyn Fn(&str) -> Duration + Send + Sync>),
}

impl RateLimitOffset {
    /// Offset to apply for `bucket_route`.
    pub fn for_route(&self, bucket_route: &str) -> Duration {
        match self {
            RateLimitOffset::Fixed(offset) => *offset,
            RateLimitOffset::PerRoute(f) => f(bucket_route),
        }
    }
}

impl fmt::Debug for RateLimitOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitOffset::Fixed(offset) => f.debug_tuple("Fixed").field(offset).finish(),
            RateLimitOffset::PerRoute(_) => f.write_str("PerRoute(..)"),
        }
    }
}

/// Decides whether a rate limit is surfaced as an error instead of waited out.
#[derive(Clone, Default)]
pub enum RejectOnRateLimit {
    /// Always wait
    #[default]
    Never,
    /// Never wait
    Always,
    /// Reject when the bucket route starts with one of the prefixes
    Routes(Vec<String>),
    /// Reject when the predicate returns `true`
    Predicate(Arc<dyn Fn(&RateLimitData) -> bool + Send + Sync>),
}

impl RejectOnRateLimit {
    pub fn should_reject(&self, data: &RateLimitData) -> bool {
        match self {
            RejectOnRateLimit::Never => false,
            RejectOnRateLimit::Always => true,
            RejectOnRateLimit::Routes(prefixes) => prefixes
                .iter()
                .any(|prefix| data.route.starts_with(&prefix.to_lowercase())),
            RejectOnRateLimit::Predicate(f) => f(data),
        }
    }
}

impl fmt::Debug for RejectOnRateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectOnRateLimit::Never => f.write_str("Never"),
            RejectOnRateLimit::Always => f.write_str("Always"),
            RejectOnRateLimit::Routes(routes) => f.debug_tuple("Routes").field(routes).finish(),
            RejectOnRateLimit::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Everything the manager needs to know about how to schedule requests.
#[derive(Debug, Clone)]
pub struct RestOptions {
    pub config: Config,
    pub offset: RateLimitOffset,
    pub reject_on_rate_limit: RejectOnRateLimit,
}

impl From<Config> for RestOptions {
    fn from(config: Config) -> Self {
        let offset = RateLimitOffset::Fixed(Duration::from_millis(config.rate_limiting.offset_ms));
        let reject_on_rate_limit = if config.rate_limiting.reject_on_rate_limit.is_empty() {
            RejectOnRateLimit::Never
        } else {
            RejectOnRateLimit::Routes(config.rate_limiting.reject_on_rate_limit.clone())
        };
        Self {
            config,
            offset,
            reject_on_rate_limit,
        }
    }
}

impl Default for RestOptions {
    fn default() -> Self {
        Self::from(Config::default())
    }
}

impl RestOptions {
    /// Replaces the offset hook.
    pub fn with_offset(mut self, offset: RateLimitOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Replaces the reject-on-rate-limit policy.
    pub fn with_reject_on_rate_limit(mut self, policy: RejectOnRateLimit) -> Self {
        self.reject_on_rate_limit = policy;
        self
    }

    /// Fails with [`RestError::InvalidConfig`] listing every validation error.
    pub fn validate(&self) -> Result<(), RestError> {
        let errors = self.config.validate();
        if errors.is_empty() {
            return Ok(());
        }
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(RestError::InvalidConfig(joined))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.rate_limiting.timeout_ms)
    }

    pub fn retries(&self) -> u32 {
        self.config.rate_limiting.retries
    }

    pub fn rate_limit_retries(&self) -> Option<u32> {
        self.config.rate_limiting.rate_limit_retries
    }

    /// Global budget, never below one request per window.
    pub fn global_requests_per_second(&self) -> u32 {
        self.config.rate_limiting.global_requests_per_second.max(1)
    }

    pub fn invalid_request_warning_interval(&self) -> u32 {
        self.config.rate_limiting.invalid_request_warning_interval
    }

    /// Hash sweep period; `None` when disabled.
    pub fn hash_sweep_interval(&self) -> Option<Duration> {
        sweep_period(self.config.sweepers.hash_sweep_interval_ms)
    }

    pub fn hash_lifetime(&self) -> Duration {
        Duration::from_millis(self.config.sweepers.hash_lifetime_ms)
    }

    /// Handler sweep period; `None` when disabled.
    pub fn handler_sweep_interval(&self) -> Option<Duration> {
        sweep_period(self.config.sweepers.handler_sweep_interval_ms)
    }
}

fn sweep_period(ms: u64) -> Option<Duration> {
    (ms != 0 && ms != SWEEPER_DISABLED).then(|| Duration::from_millis(ms))
}
