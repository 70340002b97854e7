//! Single-attempt execution shared by every handler

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fantasy_core::domain::{RequestMethod, RouteDescriptor};
use fantasy_core::ports::events::{InvalidRequestWarning, ResponseEvent, RestEvent};
use fantasy_core::ports::transport::{TransportError, TransportRequest, TransportResponse};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RequestData;
use crate::errors::{ApiError, HttpError};
use crate::manager::RestContext;
use crate::{RestError, Result};

const INVALID_REQUEST_WINDOW: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// InvalidRequestCounter
// ============================================================================

#[derive(Debug, Default)]
struct InvalidWindow {
    count: u32,
    reset_at: Option<Instant>,
}

/// Counts 401, 403 and 429 responses in a rolling ten minute window.
#[derive(Debug, Default)]
pub struct InvalidRequestCounter {
    window: Mutex<InvalidWindow>,
}

impl InvalidRequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invalid response, returning the count in the current
    /// window and the time left in it.
    pub fn increment(&self) -> (u32, Duration) {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let reset_at = match window.reset_at {
            Some(reset_at) if reset_at >= now => reset_at,
            _ => {
                window.count = 0;
                let reset_at = now + INVALID_REQUEST_WINDOW;
                window.reset_at = Some(reset_at);
                reset_at
            }
        };
        window.count += 1;
        (window.count, reset_at - now)
    }
}

/// Whether the status counts towards the invalid request limit.
pub fn is_invalid_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429)
}

/// Counts an invalid response and emits a warning every
/// `invalid_request_warning_interval` of them.
pub(crate) fn increment_invalid_count(ctx: &RestContext) {
    let (count, remaining_time) = ctx.invalid_requests.increment();
    let interval = ctx.options.invalid_request_warning_interval();
    if interval > 0 && count % interval == 0 {
        ctx.events
            .emit(RestEvent::InvalidRequestWarning(InvalidRequestWarning {
                count,
                remaining_time,
            }));
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Runs `fut` unless `signal` fires first.
pub(crate) async fn with_cancel<F: Future>(
    signal: Option<&CancellationToken>,
    fut: F,
) -> Result<F::Output> {
    match signal {
        Some(signal) => tokio::select! {
            biased;
            _ = signal.cancelled() => Err(RestError::Cancelled),
            output = fut => Ok(output),
        },
        None => Ok(fut.await),
    }
}

// ============================================================================
// Network attempt
// ============================================================================

/// Performs one network attempt.
///
/// Returns `Ok(None)` when the attempt failed transiently and `retries` has
/// not reached the configured maximum, so the caller should try again.
pub(crate) async fn make_network_request(
    ctx: &RestContext,
    route: &RouteDescriptor,
    url: &str,
    request: &TransportRequest,
    data: &RequestData,
    retries: u32,
) -> Result<Option<TransportResponse>> {
    let caller = data.signal.clone().unwrap_or_default();
    let attempt = caller.child_token();
    let timeout = ctx.options.timeout();

    let result = tokio::select! {
        biased;
        _ = caller.cancelled() => {
            attempt.cancel();
            return Err(RestError::Cancelled);
        }
        _ = tokio::time::sleep(timeout) => {
            attempt.cancel();
            Err(TransportError::Timeout)
        }
        result = ctx.transport.execute(url, request, attempt.clone()) => result,
    };

    let response = match result {
        Ok(response) => response,
        Err(_) if caller.is_cancelled() => return Err(RestError::Cancelled),
        Err(err) if err.is_transient() && retries < ctx.options.retries() => {
            debug!(
                method = %request.method,
                route = %route.bucket_route,
                retries,
                timeout_ms = timeout.as_millis() as u64,
                error = %err,
                "Transient transport failure, retrying"
            );
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    if ctx.events.has_listeners() {
        ctx.events.emit(RestEvent::Response(ResponseEvent {
            method: request.method,
            path: route.original.clone(),
            route: route.bucket_route.clone(),
            body: data.body.clone(),
            retries,
            status: response.status,
            headers: response.headers.clone(),
        }));
    }

    Ok(Some(response))
}

// ============================================================================
// Error classification
// ============================================================================

/// Classifies a non-2xx, non-429 response.
///
/// - 5xx: `Ok(None)` while retries remain, then [`HttpError`]
/// - 4xx: [`ApiError`]; a 401 on an authenticated request clears the token
/// - anything else is returned as is
pub(crate) fn handle_errors(
    ctx: &RestContext,
    method: RequestMethod,
    url: &str,
    data: &RequestData,
    response: TransportResponse,
    retries: u32,
) -> Result<Option<TransportResponse>> {
    let status = response.status;
    if (500..600).contains(&status) {
        if retries < ctx.options.retries() {
            debug!(%method, url, status, retries, "Server error, retrying");
            return Ok(None);
        }
        return Err(HttpError {
            status,
            status_text: response.status_text,
            method,
            url: url.to_string(),
            request_body: data.body.clone(),
        }
        .into());
    }

    if (400..500).contains(&status) {
        if status == 401 && data.auth {
            ctx.set_token(None);
        }
        let raw = response
            .json::<Value>()
            .unwrap_or_else(|_| Value::String(response.text()));
        return Err(ApiError::new(raw, status, method, url, data.body.clone()).into());
    }

    Ok(Some(response))
}
