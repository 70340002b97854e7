//! The rate-limit record
//!
//! Emitted with every `rateLimited` event and carried by rate-limit errors
//! when the caller opts into rejection.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use super::route::RequestMethod;

/// Scope of a 429 as reported by the `X-RateLimit-Scope` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// Per-user limit (the default when the header is absent)
    #[default]
    User,
    /// API-wide limit
    Global,
    /// Limit shared across users of a resource
    Shared,
}

impl FromStr for RateLimitScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(RateLimitScope::User),
            "global" => Ok(RateLimitScope::Global),
            "shared" => Ok(RateLimitScope::Shared),
            other => Err(format!("unknown rate limit scope '{}'", other)),
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateLimitScope::User => "user",
            RateLimitScope::Global => "global",
            RateLimitScope::Shared => "shared",
        };
        f.write_str(s)
    }
}

/// Everything known about a rate limit at the moment it was hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitData {
    /// Whether the global limit (rather than the bucket) is exhausted
    pub global: bool,
    pub method: RequestMethod,
    /// Fully resolved request URL
    pub url: String,
    /// Bucket route of the request
    pub route: String,
    pub major_parameter: String,
    /// Bucket hash of the handler that observed the limit
    pub hash: String,
    /// Request budget of the exhausted window; `None` when unbounded
    pub limit: Option<u32>,
    /// Time until the window resets
    pub time_to_reset: Duration,
    /// Server-requested wait, offset included
    pub retry_after: Duration,
    /// Wait imposed by a sublimit, zero when none applies
    pub sublimit_timeout: Duration,
    pub scope: RateLimitScope,
}

impl fmt::Display for RateLimitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} limited on {} (major parameter {}, reset in {}ms, scope {})",
            if self.global { "globally" } else { "bucket" },
            self.method,
            self.route,
            self.major_parameter,
            self.time_to_reset.as_millis(),
            self.scope
        )
    }
}
