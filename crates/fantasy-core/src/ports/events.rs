//! Observability port (driven/secondary port)
//!
//! The scheduler reports what it is doing through [`RestEvent`]s delivered to
//! registered [`IRestEventListener`]s. Listeners are called synchronously on
//! the dispatching task, so they must not block.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{rate_limit::RateLimitData, route::RequestMethod};
use crate::ports::transport::{RequestBodySummary, ResponseHeaders};

/// Details of one network attempt, reported before success/failure branching.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub method: RequestMethod,
    /// The endpoint as requested
    pub path: String,
    /// Bucket route of the endpoint
    pub route: String,
    pub body: RequestBodySummary,
    /// Retries consumed before this attempt
    pub retries: u32,
    pub status: u16,
    pub headers: ResponseHeaders,
}

/// Periodic warning about 401/403/429 responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidRequestWarning {
    /// Invalid responses seen in the current window
    pub count: u32,
    /// Time left in the current window
    pub remaining_time: Duration,
}

/// A bucket hash evicted by the hash sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweptHash {
    /// `METHOD:bucket route`
    pub key: String,
    /// The evicted hash
    pub hash: String,
}

/// Events emitted by the request manager.
#[derive(Debug, Clone, PartialEq)]
pub enum RestEvent {
    /// Free-form diagnostic text
    Debug(String),
    /// A network attempt completed
    Response(ResponseEvent),
    /// A request is about to wait for a rate limit
    RateLimited(RateLimitData),
    /// Too many invalid requests in the current window
    InvalidRequestWarning(InvalidRequestWarning),
    /// Bucket hashes evicted by one sweep pass
    HashSweep(Vec<SweptHash>),
    /// Handler ids evicted by one sweep pass
    HandlerSweep(Vec<String>),
}

/// Receives [`RestEvent`]s.
pub trait IRestEventListener: Send + Sync {
    fn on_event(&self, event: &RestEvent);
}

impl<F> IRestEventListener for F
where
    F: Fn(&RestEvent) + Send + Sync,
{
    fn on_event(&self, event: &RestEvent) {
        self(event)
    }
}
