//! Fantasy REST - rate-limit-aware request scheduler
//!
//! Sends requests to the Fantasy API while honouring the limits the server
//! advertises:
//! - Per-bucket FIFO queues driven by `X-RateLimit-*` headers
//! - A shared global budget of requests per second
//! - Sublimit handling for narrower limits inside a bucket
//! - Retries for timeouts, connection resets and 5xx responses
//!
//! ## Modules
//!
//! - [`manager`] - the [`RestManager`](manager::RestManager) facade, bucket hash
//!   table, handler table and sweepers
//! - [`handler`] - sequential and burst handlers plus the shared request executor
//! - [`global`] - the global throttle shared by every handler
//! - [`rate_limit`] - response header parsing and the reject-on-rate-limit policy
//! - [`options`] - runtime options built from [`fantasy_core::config::Config`]
//! - [`transport`] - the default `reqwest` transport
//! - [`errors`] - structured error payloads

pub mod errors;
pub mod events;
pub mod global;
pub mod handler;
pub mod manager;
pub mod options;
pub mod rate_limit;
pub mod response;
pub mod transport;

use fantasy_core::ports::transport::TransportError;
use thiserror::Error;

pub use errors::{ApiError, ErrorNode, HttpError, RateLimitError};
pub use manager::{RequestBody, RequestOptions, RestManager};
pub use options::{RateLimitOffset, RejectOnRateLimit, RestOptions};
pub use response::ResponseBody;

/// Errors surfaced by the request manager
#[derive(Debug, Error)]
pub enum RestError {
    /// The transport failed and retries (if any applied) were exhausted
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A rate limit was hit and the reject-on-rate-limit policy matched
    #[error("{0}")]
    RateLimited(Box<RateLimitError>),

    /// A 5xx response persisted after every retry
    #[error("{0}")]
    Http(Box<HttpError>),

    /// A 4xx response other than 429
    #[error("{0}")]
    Api(Box<ApiError>),

    /// The caller's cancellation token fired
    #[error("Request was cancelled")]
    Cancelled,

    /// The request needs authorization but no token is set
    #[error("Expected token to be set for this request, but none was present")]
    MissingToken,

    /// The manager options are unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<RateLimitError> for RestError {
    fn from(err: RateLimitError) -> Self {
        RestError::RateLimited(Box::new(err))
    }
}

impl From<HttpError> for RestError {
    fn from(err: HttpError) -> Self {
        RestError::Http(Box::new(err))
    }
}

impl From<ApiError> for RestError {
    fn from(err: ApiError) -> Self {
        RestError::Api(Box::new(err))
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = RestError> = std::result::Result<T, E>;
