//! Default transport backed by `reqwest`
//!
//! The scheduler enforces the per-attempt timeout itself, so the client is
//! built without one. Cancellation of the attempt token drops the in-flight
//! request.

use std::error::Error as StdError;
use std::io;

use async_trait::async_trait;
use fantasy_core::domain::RequestMethod;
use fantasy_core::ports::transport::{
    ITransport, ResponseHeaders, TransportError, TransportRequest, TransportResponse,
};
use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// [`ITransport`] implementation using a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured client (proxies, TLS roots, connection pools).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        url: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.request(to_reqwest_method(request.method), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers: ResponseHeaders = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        trace!(url, status = status.as_u16(), bytes = body.len(), "Transport response");

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl ITransport for ReqwestTransport {
    async fn execute(
        &self,
        url: &str,
        request: &TransportRequest,
        signal: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(TransportError::Aborted),
            result = self.send(url, request) => result,
        }
    }
}

fn to_reqwest_method(method: RequestMethod) -> Method {
    match method {
        RequestMethod::Delete => Method::DELETE,
        RequestMethod::Get => Method::GET,
        RequestMethod::Patch => Method::PATCH,
        RequestMethod::Post => Method::POST,
        RequestMethod::Put => Method::PUT,
    }
}

/// Maps a `reqwest` failure onto the transport error taxonomy.
fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if is_connection_reset(&err) {
        return TransportError::ConnectionReset(err.to_string());
    }
    if err.is_connect() {
        return TransportError::Connect(err.to_string());
    }
    TransportError::Other(err.to_string())
}

fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        if current.to_string().contains("ECONNRESET") {
            return true;
        }
        source = current.source();
    }
    false
}
