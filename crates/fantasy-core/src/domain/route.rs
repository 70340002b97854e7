//! Route classification
//!
//! The remote API assigns rate limits per *bucket*: a generalized route
//! (ids replaced by placeholders) further partitioned by a *major parameter*
//! (the channel, guild or webhook the request targets). This module turns a
//! concrete endpoint path into that pair.
//!
//! ## Rules
//!
//! 1. Interaction callbacks are burst-exempt and get the
//!    [`BURST_MAJOR_PARAMETER`] sentinel.
//! 2. The major parameter is the id following `/channels/`, `/guilds/` or
//!    `/webhooks/` at the start of the path (`id/token` for webhooks with a
//!    token), `"global"` otherwise.
//! 3. Every 17-19 digit id becomes `:id`; reaction values become `:reaction`
//!    and webhook tokens become `:token`.
//! 4. Deleting a message older than 14 days lands in a separate bucket.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Major parameter reserved for routes handled without a queue.
pub const BURST_MAJOR_PARAMETER: &str = "burst";

/// Major parameter used when the path carries no partitioning id.
pub const GLOBAL_MAJOR_PARAMETER: &str = "global";

/// Suffix appended to the bucket route of old-message deletes.
pub const OLD_MESSAGE_DELETE_SUFFIX: &str = "/Delete Old Message";

/// First millisecond of the identifier epoch (2015-01-01T00:00:00Z).
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Age after which a message delete is rate limited separately.
const OLD_MESSAGE_AGE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

static MAJOR_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^/webhooks/([0-9]{17,19}/[^/?]+))|(?:^/(?:channels|guilds|webhooks)/([0-9]{17,19}))")
        .expect("valid major id regex")
});
static SNOWFLAKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]{17,19}").expect("valid snowflake regex"));
static TRAILING_SNOWFLAKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]{17,19}$").expect("valid trailing snowflake regex"));
static REACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/reactions/(.*)").expect("valid reaction regex"));
static WEBHOOK_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/webhooks/:id/[^/?]+").expect("valid webhook token regex"));

// ============================================================================
// RequestMethod
// ============================================================================

/// HTTP methods accepted by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Delete,
    Get,
    Patch,
    Post,
    Put,
}

impl RequestMethod {
    /// Upper-case wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Delete => "DELETE",
            RequestMethod::Get => "GET",
            RequestMethod::Patch => "PATCH",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
        }
    }

    /// Whether requests with this method are sent without a body.
    pub fn is_bodyless(&self) -> bool {
        matches!(self, RequestMethod::Get)
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RouteDescriptor
// ============================================================================

/// The rate-limit identity of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Generalized route, e.g. `/channels/:id/messages/:id`
    pub bucket_route: String,
    /// Identifier partitioning the bucket, or `"global"` / `"burst"`
    pub major_parameter: String,
    /// The endpoint exactly as requested
    pub original: String,
}

impl RouteDescriptor {
    /// Classifies `endpoint` for `method` using the current time.
    pub fn classify(endpoint: &str, method: RequestMethod) -> Self {
        Self::classify_at(endpoint, method, Utc::now())
    }

    /// Classifies `endpoint` for `method` as of `now`.
    ///
    /// `now` only matters for the old-message delete rule.
    pub fn classify_at(endpoint: &str, method: RequestMethod, now: DateTime<Utc>) -> Self {
        if endpoint.starts_with("/interactions/") && endpoint.ends_with("/callback") {
            return Self {
                bucket_route: "/interactions/:id/:token/callback".to_string(),
                major_parameter: BURST_MAJOR_PARAMETER.to_string(),
                original: endpoint.to_string(),
            };
        }

        let major_parameter = MAJOR_ID
            .captures(endpoint)
            .and_then(|caps| caps.get(2).or_else(|| caps.get(1)))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| GLOBAL_MAJOR_PARAMETER.to_string());

        let generalized = SNOWFLAKE.replace_all(endpoint, ":id");
        let generalized = REACTION.replace(&generalized, "/reactions/:reaction");
        let mut bucket_route = WEBHOOK_TOKEN
            .replace(&generalized, "/webhooks/:id/:token")
            .into_owned();

        if method == RequestMethod::Delete && bucket_route == "/channels/:id/messages/:id" {
            let is_old = TRAILING_SNOWFLAKE
                .find(endpoint)
                .and_then(|m| snowflake_timestamp_ms(m.as_str()))
                .map(|created| now.timestamp_millis() - created > OLD_MESSAGE_AGE_MS)
                .unwrap_or(false);
            if is_old {
                bucket_route.push_str(OLD_MESSAGE_DELETE_SUFFIX);
            }
        }

        Self {
            bucket_route,
            major_parameter,
            original: endpoint.to_string(),
        }
    }

    /// Whether this route bypasses per-bucket queueing.
    pub fn is_burst(&self) -> bool {
        self.major_parameter == BURST_MAJOR_PARAMETER
    }
}

/// Milliseconds since the Unix epoch encoded in a time-ordered identifier.
pub fn snowflake_timestamp_ms(id: &str) -> Option<i64> {
    let raw: u64 = id.parse().ok()?;
    Some((raw >> 22) as i64 + SNOWFLAKE_EPOCH_MS)
}
