//! Request manager
//!
//! [`RestManager`] is the entry point of the crate. It resolves a request to
//! a URL and transport request, finds the handler responsible for its
//! bucket and hands the request over.
//!
//! ## State
//!
//! - the bucket hash table, `METHOD:bucket route` to the server-assigned
//!   hash, refreshed by handlers and swept once entries outlive
//!   `hash_lifetime_ms`
//! - the handler table, `hash:major parameter` to a live handler, swept
//!   when handlers are idle
//! - the [`GlobalThrottle`] shared by every handler
//!
//! Both sweepers run as Tokio tasks and stop when the manager is dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use fantasy_core::config::Config;
use fantasy_core::domain::{RequestMethod, RouteDescriptor};
use fantasy_core::ports::events::{IRestEventListener, RestEvent, SweptHash};
use fantasy_core::ports::transport::{
    ITransport, RequestBodySummary, TransportRequest, TransportResponse,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventEmitter;
use crate::global::GlobalThrottle;
use crate::handler::{
    BurstHandler, InvalidRequestCounter, RequestData, RequestHandler, SequentialHandler,
};
use crate::options::RestOptions;
use crate::response::{parse_response, ResponseBody};
use crate::transport::ReqwestTransport;
use crate::{RestError, Result};

/// Prefix of the `User-Agent` header sent with every request.
pub const USER_AGENT: &str = concat!("FantasyClient v", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Request options
// ============================================================================

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Serialized as JSON with `Content-Type: application/json`
    Json(Value),
    /// Sent as is
    Raw {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
}

/// Everything needed to issue one request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Endpoint path, e.g. `/channels/123/messages`
    pub full_route: String,
    pub method: RequestMethod,
    /// Query string pairs, appended form-urlencoded
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Extra headers; the manager's own headers take precedence
    pub headers: BTreeMap<String, String>,
    /// Whether to send the stored token
    pub auth: bool,
    /// Overrides `api.auth_prefix`
    pub auth_prefix: Option<String>,
    /// Audit log reason
    pub reason: Option<String>,
    /// Whether to prefix the route with `/v{version}`
    pub versioned: bool,
    pub signal: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            full_route: String::new(),
            method: RequestMethod::Get,
            query: Vec::new(),
            body: None,
            headers: BTreeMap::new(),
            auth: true,
            auth_prefix: None,
            reason: None,
            versioned: true,
            signal: None,
        }
    }
}

impl RequestOptions {
    pub fn new(method: RequestMethod, full_route: impl Into<String>) -> Self {
        Self {
            full_route: full_route.into(),
            method,
            ..Self::default()
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn raw(mut self, bytes: Vec<u8>, content_type: Option<String>) -> Self {
        self.body = Some(RequestBody::Raw {
            bytes,
            content_type,
        });
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sends the request without the stored token.
    pub fn unauthenticated(mut self) -> Self {
        self.auth = false;
        self
    }

    pub fn auth_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.auth_prefix = Some(prefix.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Omits the `/v{version}` prefix.
    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

// ============================================================================
// RestContext
// ============================================================================

/// A bucket hash and when it was last confirmed by a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHashEntry {
    pub value: String,
    /// `None` for entries that must never be swept
    pub last_access: Option<Instant>,
}

/// State shared by the manager, its handlers and its sweepers.
pub struct RestContext {
    pub options: RestOptions,
    pub transport: Arc<dyn ITransport>,
    pub global: GlobalThrottle,
    pub hashes: DashMap<String, BucketHashEntry>,
    pub events: EventEmitter,
    pub invalid_requests: InvalidRequestCounter,
    token: RwLock<Option<String>>,
}

impl RestContext {
    fn new(options: RestOptions, transport: Arc<dyn ITransport>) -> Self {
        let global = GlobalThrottle::new(options.global_requests_per_second());
        Self {
            options,
            transport,
            global,
            hashes: DashMap::new(),
            events: EventEmitter::new(),
            invalid_requests: InvalidRequestCounter::new(),
            token: RwLock::new(None),
        }
    }

    /// Rate-limit offset for `bucket_route`.
    pub fn offset(&self, bucket_route: &str) -> Duration {
        self.options.offset.for_route(bucket_route)
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        if token.is_none() {
            debug!("Clearing stored token");
        }
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Current hash for a route, or the synthetic global hash when the
    /// server has not assigned one yet.
    pub fn bucket_hash(&self, method: RequestMethod, bucket_route: &str) -> String {
        let key = hash_key(method, bucket_route);
        match self.hashes.get(&key) {
            Some(entry) => entry.value.clone(),
            None => format!("Global({})", key),
        }
    }

    /// Records the hash a response reported for a route.
    ///
    /// Returns `true` when it differs from `current` and was stored, `false`
    /// when it only refreshed the entry's last access.
    pub fn record_bucket_hash(
        &self,
        method: RequestMethod,
        bucket_route: &str,
        hash: &str,
        current: &str,
    ) -> bool {
        let key = hash_key(method, bucket_route);
        let now = Instant::now();
        if hash != current {
            self.hashes.insert(
                key,
                BucketHashEntry {
                    value: hash.to_string(),
                    last_access: Some(now),
                },
            );
            return true;
        }
        if let Some(mut entry) = self.hashes.get_mut(&key) {
            if entry.last_access.is_some() {
                entry.last_access = Some(now);
            }
        }
        false
    }
}

/// Key of the bucket hash table.
pub fn hash_key(method: RequestMethod, bucket_route: &str) -> String {
    format!("{}:{}", method, bucket_route)
}

// ============================================================================
// RestManager
// ============================================================================

type HandlerTable = DashMap<String, Arc<dyn RequestHandler>>;

/// Rate-limit-aware REST client.
pub struct RestManager {
    ctx: Arc<RestContext>,
    handlers: Arc<HandlerTable>,
    hash_sweeper: Mutex<Option<CancellationToken>>,
    handler_sweeper: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl RestManager {
    /// Creates a manager and starts its sweepers.
    ///
    /// Fails with [`RestError::InvalidConfig`] when the options do not
    /// validate, e.g. a sweep interval above four hours.
    ///
    /// Sweepers are spawned on the current Tokio runtime; outside of one they
    /// are skipped with a warning.
    pub fn new(options: RestOptions, transport: Arc<dyn ITransport>) -> Result<Self> {
        options.validate()?;

        let manager = Self {
            ctx: Arc::new(RestContext::new(options, transport)),
            handlers: Arc::new(DashMap::new()),
            hash_sweeper: Mutex::new(None),
            handler_sweeper: Mutex::new(None),
            shutdown: CancellationToken::new(),
        };
        manager.start_sweepers();

        info!(
            base_url = %manager.ctx.options.config.api.base_url,
            version = %manager.ctx.options.config.api.version,
            "REST manager ready"
        );
        Ok(manager)
    }

    /// Creates a manager using [`ReqwestTransport`].
    pub fn with_reqwest(options: RestOptions) -> Result<Self> {
        Self::new(options, Arc::new(ReqwestTransport::new()))
    }

    /// Creates a manager from a loaded configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_reqwest(RestOptions::from(config))
    }

    pub fn options(&self) -> &RestOptions {
        &self.ctx.options
    }

    pub fn global(&self) -> &GlobalThrottle {
        &self.ctx.global
    }

    // ------------------------------------------------------------------------
    // Token and listeners
    // ------------------------------------------------------------------------

    pub fn set_token(&self, token: Option<String>) {
        self.ctx.set_token(token);
    }

    pub fn token(&self) -> Option<String> {
        self.ctx.token()
    }

    pub fn add_listener(&self, listener: Arc<dyn IRestEventListener>) {
        self.ctx.events.add_listener(listener);
    }

    pub fn has_listeners(&self) -> bool {
        self.ctx.events.has_listeners()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    pub async fn get(
        &self,
        full_route: impl Into<String>,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        self.verb(RequestMethod::Get, full_route, options).await
    }

    pub async fn post(
        &self,
        full_route: impl Into<String>,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        self.verb(RequestMethod::Post, full_route, options).await
    }

    pub async fn put(
        &self,
        full_route: impl Into<String>,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        self.verb(RequestMethod::Put, full_route, options).await
    }

    pub async fn patch(
        &self,
        full_route: impl Into<String>,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        self.verb(RequestMethod::Patch, full_route, options).await
    }

    pub async fn delete(
        &self,
        full_route: impl Into<String>,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        self.verb(RequestMethod::Delete, full_route, options).await
    }

    async fn verb(
        &self,
        method: RequestMethod,
        full_route: impl Into<String>,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        self.request(RequestOptions {
            full_route: full_route.into(),
            method,
            ..options
        })
        .await
    }

    /// Runs a request and decodes its body.
    pub async fn request(&self, options: RequestOptions) -> Result<ResponseBody> {
        let response = self.queue_request(options).await?;
        parse_response(response)
    }

    /// Runs a request through its bucket's handler and returns the raw
    /// response.
    pub async fn queue_request(&self, options: RequestOptions) -> Result<TransportResponse> {
        let route = RouteDescriptor::classify(&options.full_route, options.method);
        let hash = self.ctx.bucket_hash(options.method, &route.bucket_route);
        let (url, request, data) = self.resolve_request(options)?;

        let (handler, _activity) = {
            let entry = self
                .handlers
                .entry(format!("{}:{}", hash, route.major_parameter))
                .or_insert_with(|| self.create_handler(&hash, &route));
            let activity = entry.activity().enter();
            (Arc::clone(entry.value()), activity)
        };

        handler.queue_request(&route, &url, request, data).await
    }

    fn create_handler(&self, hash: &str, route: &RouteDescriptor) -> Arc<dyn RequestHandler> {
        let ctx = Arc::clone(&self.ctx);
        let handler: Arc<dyn RequestHandler> = if route.is_burst() {
            Arc::new(BurstHandler::new(ctx, hash, &route.major_parameter))
        } else {
            Arc::new(SequentialHandler::new(ctx, hash, &route.major_parameter))
        };
        debug!(handler = handler.id(), route = %route.bucket_route, "Created handler");
        handler
    }

    /// Builds the URL, headers and body of a request.
    ///
    /// Fails with [`RestError::MissingToken`] when the request needs a token
    /// and none is set.
    pub fn resolve_request(
        &self,
        options: RequestOptions,
    ) -> Result<(String, TransportRequest, RequestData)> {
        let api = &self.ctx.options.config.api;

        let mut url = api.base_url.trim_end_matches('/').to_string();
        if options.versioned {
            url.push_str(&format!("/v{}", api.version));
        }
        url.push_str(&options.full_route);
        if !options.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&options.query)
                .finish();
            url.push('?');
            url.push_str(&query);
        }

        let mut base = api.headers.clone();
        base.insert(
            "User-Agent".to_string(),
            format!("{} {}", USER_AGENT, api.user_agent_appendix)
                .trim()
                .to_string(),
        );
        if options.auth {
            let token = self.ctx.token().ok_or(RestError::MissingToken)?;
            let prefix = options.auth_prefix.as_deref().unwrap_or(&api.auth_prefix);
            base.insert("Authorization".to_string(), format!("{} {}", prefix, token));
        }
        if let Some(reason) = options.reason.as_deref().filter(|r| !r.is_empty()) {
            base.insert("X-Audit-Log-Reason".to_string(), encode_component(reason));
        }

        let mut headers = options.headers;
        let mut summary = RequestBodySummary::default();
        let body = match options.body {
            Some(RequestBody::Json(value)) => {
                let bytes = serde_json::to_vec(&value)
                    .map_err(|e| RestError::InvalidConfig(format!("unserializable body: {}", e)))?;
                headers.insert("Content-Type".to_string(), "application/json".to_string());
                summary.json = Some(value);
                Some(bytes)
            }
            Some(RequestBody::Raw {
                bytes,
                content_type,
            }) => {
                if let Some(content_type) = content_type {
                    headers.insert("Content-Type".to_string(), content_type);
                }
                summary.raw_len = Some(bytes.len());
                Some(bytes)
            }
            None => None,
        };
        headers.extend(base);

        let request = TransportRequest {
            method: options.method,
            headers,
            body: if options.method.is_bodyless() { None } else { body },
        };
        let data = RequestData {
            body: summary,
            auth: options.auth,
            signal: options.signal,
        };
        Ok((url, request, data))
    }

    // ------------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------------

    /// Stored hash for `METHOD:bucket route`, if the server assigned one.
    pub fn bucket_hash(&self, method: RequestMethod, bucket_route: &str) -> Option<String> {
        self.ctx
            .hashes
            .get(&hash_key(method, bucket_route))
            .map(|entry| entry.value.clone())
    }

    /// Ids of every live handler.
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Evicts bucket hashes not confirmed within `hash_lifetime_ms`.
    pub fn sweep_hashes(&self) -> Vec<SweptHash> {
        sweep_hashes(&self.ctx)
    }

    /// Evicts idle handlers.
    pub fn sweep_handlers(&self) -> Vec<String> {
        sweep_handlers(&self.ctx, &self.handlers)
    }

    // ------------------------------------------------------------------------
    // Sweepers
    // ------------------------------------------------------------------------

    fn start_sweepers(&self) {
        let hash_interval = self.ctx.options.hash_sweep_interval();
        let handler_interval = self.ctx.options.handler_sweep_interval();
        if hash_interval.is_none() && handler_interval.is_none() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("No Tokio runtime available, sweepers are disabled");
            return;
        };

        if let Some(interval) = hash_interval {
            let ctx = Arc::clone(&self.ctx);
            let token = self.spawn_sweeper(&runtime, "hash", interval, move || {
                sweep_hashes(&ctx);
            });
            *lock(&self.hash_sweeper) = Some(token);
        }
        if let Some(interval) = handler_interval {
            let ctx = Arc::clone(&self.ctx);
            let handlers = Arc::clone(&self.handlers);
            let token = self.spawn_sweeper(&runtime, "handler", interval, move || {
                sweep_handlers(&ctx, &handlers);
            });
            *lock(&self.handler_sweeper) = Some(token);
        }
    }

    fn spawn_sweeper<F>(
        &self,
        runtime: &Handle,
        name: &'static str,
        period: Duration,
        mut sweep: F,
    ) -> CancellationToken
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let cancel = token.clone();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => sweep(),
                }
            }
            debug!(sweeper = name, "Sweeper stopped");
        });
        debug!(
            sweeper = name,
            interval_ms = period.as_millis() as u64,
            "Sweeper started"
        );
        token
    }

    /// Stops the hash sweeper.
    pub fn clear_hash_sweeper(&self) {
        if let Some(token) = lock(&self.hash_sweeper).take() {
            token.cancel();
        }
    }

    /// Stops the handler sweeper.
    pub fn clear_handler_sweeper(&self) {
        if let Some(token) = lock(&self.handler_sweeper).take() {
            token.cancel();
        }
    }

    /// Stops both sweepers.
    pub fn shutdown(&self) {
        self.clear_hash_sweeper();
        self.clear_handler_sweeper();
        self.shutdown.cancel();
    }
}

impl Drop for RestManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestManager")
            .field("handlers", &self.handlers.len())
            .field("hashes", &self.ctx.hashes.len())
            .field("global", &self.ctx.global)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Percent-encodes a header value the way URI components are encoded.
/// Everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is escaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

fn sweep_hashes(ctx: &RestContext) -> Vec<SweptHash> {
    let now = Instant::now();
    let lifetime = ctx.options.hash_lifetime();
    let mut swept = Vec::new();
    ctx.hashes.retain(|key, entry| {
        let Some(last_access) = entry.last_access else {
            return true;
        };
        if now.saturating_duration_since(last_access) > lifetime {
            swept.push(SweptHash {
                key: key.clone(),
                hash: entry.value.clone(),
            });
            return false;
        }
        true
    });

    for entry in &swept {
        ctx.events.debug(format!(
            "Hash {} for {} swept due to lifetime being exceeded",
            entry.hash, entry.key
        ));
    }
    ctx.events.emit(RestEvent::HashSweep(swept.clone()));
    swept
}

fn sweep_handlers(ctx: &RestContext, handlers: &HandlerTable) -> Vec<String> {
    let started = Instant::now();
    let candidates: Vec<String> = handlers
        .iter()
        .filter(|entry| entry.value().inactive())
        .map(|entry| entry.key().clone())
        .collect();

    let mut swept = Vec::new();
    for key in candidates {
        let removed = handlers.remove_if(&key, |_, handler| {
            handler.inactive() && handler.activity().last_touched() < started
        });
        if removed.is_some() {
            swept.push(key);
        }
    }

    for id in &swept {
        ctx.events
            .debug(format!("Handler {} swept due to being inactive", id));
    }
    ctx.events.emit(RestEvent::HandlerSweep(swept.clone()));
    swept
}
