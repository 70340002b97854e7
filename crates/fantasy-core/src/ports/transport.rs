//! Transport port (driven/secondary port)
//!
//! This module defines the interface for issuing one HTTP exchange. The
//! scheduler decides *when* a request is sent; the transport only decides
//! *how*. The default adapter is `fantasy_rest::transport::ReqwestTransport`,
//! tests plug in scripted implementations.
//!
//! ## Design Notes
//!
//! - Uses `#[async_trait]` for async trait methods.
//! - Cancellation is cooperative: the scheduler passes a `CancellationToken`
//!   that fires on timeout or caller abort, and also stops polling the
//!   returned future.
//! - Response headers are looked up case-insensitively.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::route::RequestMethod;

// ============================================================================
// TransportRequest
// ============================================================================

/// A fully resolved request, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: RequestMethod,
    /// Header name to value, names as supplied by the caller
    pub headers: BTreeMap<String, String>,
    /// Encoded body; always `None` for GET requests
    pub body: Option<Vec<u8>>,
}

/// What the caller sent, kept for error reports and response events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBodySummary {
    /// JSON body, if the request had one
    pub json: Option<serde_json::Value>,
    /// Number of raw (non-JSON) body bytes
    pub raw_len: Option<usize>,
}

// ============================================================================
// ResponseHeaders
// ============================================================================

/// Response headers with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: BTreeMap<String, String>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value with the same name.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Returns the header value, ignoring the case of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the header is present at all.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterates over `(lower-cased name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for ResponseHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = ResponseHeaders::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

// ============================================================================
// TransportResponse
// ============================================================================

/// A complete HTTP response with its body already read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Canonical reason phrase, e.g. `Internal Server Error`
    pub status_text: String,
    pub headers: ResponseHeaders,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the server declared a JSON body.
    pub fn is_json(&self) -> bool {
        self.headers
            .get("content-type")
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false)
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// ============================================================================
// TransportError
// ============================================================================

/// Failures below the HTTP layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt exceeded its timeout and was aborted
    #[error("Request timed out")]
    Timeout,

    /// The peer reset the connection (ECONNRESET)
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// The attempt was aborted through its cancellation token
    #[error("Request aborted")]
    Aborted,

    /// The connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Any other transport failure
    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether a fresh attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::ConnectionReset(_)
        )
    }
}

// ============================================================================
// ITransport trait
// ============================================================================

/// Executes a single HTTP exchange.
#[async_trait]
pub trait ITransport: Send + Sync {
    /// Sends `request` to `url` and returns the full response.
    ///
    /// Implementations should abort promptly once `signal` is cancelled and
    /// report it as [`TransportError::Aborted`].
    async fn execute(
        &self,
        url: &str,
        request: &TransportRequest,
        signal: CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}
