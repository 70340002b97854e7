//! Shared helpers for the request manager integration tests
//!
//! - [`ScriptedTransport`]: an in-memory transport that replays scripted
//!   replies per route and records when each request went out. Used with
//!   paused Tokio time so rate-limit waits are exact.
//! - [`setup_rest_mock`]: a wiremock server with a manager pointed at it.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fantasy_core::config::{Config, ConfigBuilder};
use fantasy_core::domain::RequestMethod;
use fantasy_core::ports::events::RestEvent;
use fantasy_core::ports::transport::{
    ITransport, ResponseHeaders, TransportError, TransportRequest, TransportResponse,
};
use fantasy_rest::{RestManager, RestOptions};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

pub const SCRIPTED_BASE: &str = "http://scripted.test";
pub const TOKEN: &str = "test-token";

// ============================================================================
// ScriptedTransport
// ============================================================================

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond immediately
    Now(TransportResponse),
    /// Respond after a delay
    After(Duration, TransportResponse),
    /// Fail immediately
    Fail(TransportError),
    /// Never respond; only cancellation ends the attempt
    Hang,
}

/// A request as seen by the transport.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub method: RequestMethod,
    /// Route after the versioned base, query included
    pub route: String,
    /// Time since the transport was created
    pub at: Duration,
    pub body: Option<serde_json::Value>,
}

/// Replays replies queued per route; unscripted requests get a 204.
pub struct ScriptedTransport {
    started: Instant,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    dispatched: Mutex<Vec<Dispatch>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            scripts: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
        })
    }

    /// Queues `reply` for the next request to `route` (e.g. `/gateway`).
    pub fn script(&self, route: &str, reply: Reply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn dispatched(&self) -> Vec<Dispatch> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Dispatch offsets in whole milliseconds.
    pub fn dispatch_times_ms(&self) -> Vec<u128> {
        self.dispatched().iter().map(|d| d.at.as_millis()).collect()
    }

    pub fn calls(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }
}

#[async_trait]
impl ITransport for ScriptedTransport {
    async fn execute(
        &self,
        url: &str,
        request: &TransportRequest,
        signal: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let route = url
            .strip_prefix(&format!("{}/v1", SCRIPTED_BASE))
            .unwrap_or(url)
            .to_string();
        let path = route.split('?').next().unwrap_or_default().to_string();

        self.dispatched.lock().unwrap().push(Dispatch {
            method: request.method,
            route,
            at: self.started.elapsed(),
            body: request
                .body
                .as_ref()
                .and_then(|b| serde_json::from_slice(b).ok()),
        });

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::Now(reply(204, &[])));

        match reply {
            Reply::Now(response) => Ok(response),
            Reply::After(delay, response) => tokio::select! {
                _ = signal.cancelled() => Err(TransportError::Aborted),
                _ = tokio::time::sleep(delay) => Ok(response),
            },
            Reply::Fail(err) => Err(err),
            Reply::Hang => {
                signal.cancelled().await;
                Err(TransportError::Aborted)
            }
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// A response with an empty body and the given headers.
pub fn reply(status: u16, headers: &[(&str, &str)]) -> TransportResponse {
    TransportResponse {
        status,
        status_text: reason_phrase(status).to_string(),
        headers: headers.iter().copied().collect::<ResponseHeaders>(),
        body: Vec::new(),
    }
}

/// A JSON response with the given headers.
pub fn json_reply(
    status: u16,
    body: serde_json::Value,
    headers: &[(&str, &str)],
) -> TransportResponse {
    let mut response = reply(status, headers);
    response.headers.insert("Content-Type", "application/json");
    response.body = serde_json::to_vec(&body).unwrap();
    response
}

// ============================================================================
// Managers
// ============================================================================

/// Config for scripted tests: sweepers disabled, zero-noise defaults.
pub fn scripted_config() -> ConfigBuilder {
    ConfigBuilder::new()
        .api_base_url(SCRIPTED_BASE)
        .api_version("1")
        .sweepers_hash_sweep_interval_ms(0)
        .sweepers_handler_sweep_interval_ms(0)
}

pub fn scripted_manager(config: Config, transport: Arc<ScriptedTransport>) -> RestManager {
    scripted_manager_with(RestOptions::from(config), transport)
}

pub fn scripted_manager_with(
    options: RestOptions,
    transport: Arc<ScriptedTransport>,
) -> RestManager {
    let manager = RestManager::new(options, transport).unwrap();
    manager.set_token(Some(TOKEN.to_string()));
    manager
}

/// Records every event the manager emits.
pub fn record_events(manager: &RestManager) -> Arc<Mutex<Vec<RestEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.add_listener(Arc::new(move |event: &RestEvent| {
        sink.lock().unwrap().push(event.clone());
    }));
    events
}

/// Starts a wiremock server and a `reqwest`-backed manager pointed at it.
pub async fn setup_rest_mock(config: ConfigBuilder) -> (MockServer, RestManager) {
    let server = MockServer::start().await;
    let manager = RestManager::from_config(
        config
            .api_base_url(server.uri())
            .api_version("1")
            .build(),
    )
    .unwrap();
    manager.set_token(Some(TOKEN.to_string()));
    (server, manager)
}
