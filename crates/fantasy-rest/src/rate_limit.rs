//! Rate-limit header parsing and policy checks
//!
//! - [`RateLimitHeaders`]: the `X-RateLimit-*` and `Retry-After` headers of
//!   one response
//! - [`has_sublimit`]: whether a request may fall under a narrower limit
//!   inside its bucket
//! - [`check_reject`]: applies the reject-on-rate-limit policy to a record

use std::time::Duration;

use fantasy_core::domain::{RateLimitData, RateLimitScope, RequestMethod};
use fantasy_core::ports::transport::ResponseHeaders;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use crate::errors::RateLimitError;
use crate::options::RejectOnRateLimit;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_SCOPE: &str = "x-ratelimit-scope";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Longest wait accepted from a header; larger values are clamped.
pub const MAX_HEADER_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Used when a deadline does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

// ============================================================================
// RateLimitHeaders
// ============================================================================

/// Rate-limit information carried by one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// `None` when the header is absent (unbounded)
    pub limit: Option<u32>,
    /// Defaults to 1 when the header is absent
    pub remaining: i64,
    /// Time until the bucket resets; `None` when absent
    pub reset_after: Option<Duration>,
    /// Opaque bucket hash
    pub bucket: Option<String>,
    /// Server-requested wait, without any offset
    pub retry_after: Option<Duration>,
    /// Whether `X-RateLimit-Global` was present
    pub global: bool,
    pub scope: RateLimitScope,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &ResponseHeaders) -> Self {
        let limit = headers
            .get(HEADER_LIMIT)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|v| v.max(0.0) as u32);
        let remaining = headers
            .get(HEADER_REMAINING)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|v| v as i64)
            .unwrap_or(1);
        let scope = headers
            .get(HEADER_SCOPE)
            .map(|v| {
                v.parse().unwrap_or_else(|err: String| {
                    warn!(value = v, error = %err, "Unrecognised rate limit scope, assuming user");
                    RateLimitScope::User
                })
            })
            .unwrap_or_default();

        Self {
            limit,
            remaining,
            reset_after: headers.get(HEADER_RESET_AFTER).and_then(parse_seconds),
            bucket: headers.get(HEADER_BUCKET).map(str::to_string),
            retry_after: headers.get(HEADER_RETRY_AFTER).and_then(parse_seconds),
            global: headers.contains(HEADER_GLOBAL),
            scope,
        }
    }
}

/// Parses a (possibly fractional) number of seconds, clamped to
/// [`MAX_HEADER_WAIT`].
pub fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        warn!(value, "Ignoring malformed rate limit duration");
        return None;
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if duration <= MAX_HEADER_WAIT => Some(duration),
        _ => {
            warn!(
                value,
                max_secs = MAX_HEADER_WAIT.as_secs(),
                "Rate limit duration too large, clamping"
            );
            Some(MAX_HEADER_WAIT)
        }
    }
}

/// `now + after`, or a far-future instant when that overflows.
pub fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

// ============================================================================
// Sublimits
// ============================================================================

/// Whether a request may be subject to a sublimit of its bucket.
///
/// Only renames and topic changes are sublimited on `/channels/:id`; every
/// other bucket route is assumed to possibly carry one.
pub fn has_sublimit(bucket_route: &str, method: RequestMethod, body: Option<&Value>) -> bool {
    if bucket_route != "/channels/:id" {
        return true;
    }
    if method != RequestMethod::Patch {
        return false;
    }
    match body {
        Some(Value::Object(map)) => map.contains_key("name") || map.contains_key("topic"),
        _ => false,
    }
}

// ============================================================================
// Reject policy
// ============================================================================

/// Fails with a [`RateLimitError`] when the policy opts into rejection.
pub fn check_reject(policy: &RejectOnRateLimit, data: &RateLimitData) -> Result<(), RateLimitError> {
    if policy.should_reject(data) {
        return Err(RateLimitError { data: data.clone() });
    }
    Ok(())
}
