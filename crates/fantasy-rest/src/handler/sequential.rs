//! Sequential handler
//!
//! Runs the requests of one bucket strictly in submission order. Requests
//! enter through one of two lanes, each a fair async mutex:
//!
//! - the primary lane, which every request joins by default
//! - the sublimit lane, opened by the first request that hits a sublimit and
//!   joined by every later sublimited request until it drains
//!
//! Attempts from both lanes also take the `dispatch` mutex, so the two lanes
//! never have a request on the wire at the same time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fantasy_core::domain::{RateLimitData, RateLimitScope, RequestMethod, RouteDescriptor};
use fantasy_core::ports::events::RestEvent;
use fantasy_core::ports::transport::{TransportRequest, TransportResponse};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::shared::{
    handle_errors, increment_invalid_count, is_invalid_status, make_network_request, with_cancel,
};
use super::{HandlerActivity, RequestData, RequestHandler};
use crate::errors::RateLimitError;
use crate::manager::RestContext;
use crate::rate_limit::{check_reject, deadline, has_sublimit, RateLimitHeaders};
use crate::{RestError, Result};

// ============================================================================
// State
// ============================================================================

/// Local view of the bucket, refreshed from every response.
#[derive(Debug)]
struct BucketState {
    /// `None` until the server reports a limit
    limit: Option<u32>,
    remaining: i64,
    /// Reset time, offset already applied
    reset_at: Option<Instant>,
}

impl Default for BucketState {
    fn default() -> Self {
        Self {
            limit: None,
            remaining: 1,
            reset_at: None,
        }
    }
}

impl BucketState {
    fn is_limited(&self, now: Instant) -> bool {
        self.remaining <= 0 && self.reset_at.map_or(false, |r| now < r)
    }

    fn time_to_reset(&self, now: Instant) -> Duration {
        self.reset_at
            .map_or(Duration::ZERO, |r| r.saturating_duration_since(now))
    }
}

/// Two-state latch: inactive, or active with `members` requests holding or
/// waiting for the sublimit lane.
#[derive(Debug, Default)]
struct SublimitLatch {
    active: bool,
    members: usize,
}

/// Membership of the sublimit lane; the latch closes when the last member
/// leaves.
struct SublimitMembership<'a> {
    latch: &'a Mutex<SublimitLatch>,
}

impl Drop for SublimitMembership<'_> {
    fn drop(&mut self) {
        let mut latch = self.latch.lock().unwrap_or_else(PoisonError::into_inner);
        latch.members = latch.members.saturating_sub(1);
        if latch.members == 0 {
            latch.active = false;
        }
    }
}

/// The lane a request currently occupies.
enum Lane<'a> {
    Primary {
        guard: OwnedMutexGuard<()>,
    },
    Sublimit {
        _guard: OwnedMutexGuard<()>,
        _membership: SublimitMembership<'a>,
    },
}

/// What a response said about rate limits, beyond the bucket counters.
#[derive(Debug, Clone, Copy)]
struct LimitUpdate {
    retry_after: Duration,
    sublimit_timeout: Option<Duration>,
    scope: RateLimitScope,
}

// ============================================================================
// SequentialHandler
// ============================================================================

/// FIFO queue for one `(bucket hash, major parameter)` pair.
pub struct SequentialHandler {
    id: String,
    hash: String,
    major_parameter: String,
    ctx: Arc<RestContext>,
    activity: Arc<HandlerActivity>,
    primary: Arc<AsyncMutex<()>>,
    sublimit_lane: Arc<AsyncMutex<()>>,
    dispatch: AsyncMutex<()>,
    state: Mutex<BucketState>,
    sublimit: Mutex<SublimitLatch>,
}

impl SequentialHandler {
    pub fn new(ctx: Arc<RestContext>, hash: &str, major_parameter: &str) -> Self {
        Self {
            id: format!("{}:{}", hash, major_parameter),
            hash: hash.to_string(),
            major_parameter: major_parameter.to_string(),
            ctx,
            activity: HandlerActivity::new(),
            primary: Arc::new(AsyncMutex::new(())),
            sublimit_lane: Arc::new(AsyncMutex::new(())),
            dispatch: AsyncMutex::new(()),
            state: Mutex::new(BucketState::default()),
            sublimit: Mutex::new(SublimitLatch::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_limited(&self) -> bool {
        self.state().is_limited(Instant::now())
    }

    fn sublimit_active(&self) -> bool {
        self.sublimit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }

    fn debug(&self, message: impl AsRef<str>) {
        self.ctx
            .events
            .emit(RestEvent::Debug(format!("[REST {}] {}", self.id, message.as_ref())));
    }

    fn enter_sublimit(&self) -> SublimitMembership<'_> {
        let mut latch = self.sublimit.lock().unwrap_or_else(PoisonError::into_inner);
        latch.active = true;
        latch.members += 1;
        SublimitMembership {
            latch: &self.sublimit,
        }
    }

    async fn join_sublimit_lane(&self, signal: Option<&CancellationToken>) -> Result<Lane<'_>> {
        let membership = self.enter_sublimit();
        let guard = with_cancel(signal, Arc::clone(&self.sublimit_lane).lock_owned()).await?;
        Ok(Lane::Sublimit {
            _guard: guard,
            _membership: membership,
        })
    }

    /// Blocks until the bucket has room, then takes a slot from the global
    /// budget.
    async fn acquire_slot(
        &self,
        route: &RouteDescriptor,
        url: &str,
        method: RequestMethod,
        signal: Option<&CancellationToken>,
    ) -> Result<()> {
        loop {
            let global_wait = if self.local_limited() {
                None
            } else {
                match self.ctx.global.try_reserve() {
                    Ok(()) => return Ok(()),
                    Err(wait) => Some(wait),
                }
            };

            let global = global_wait.is_some();
            let (limit, timeout) = match global_wait {
                Some(wait) => (
                    Some(self.ctx.options.global_requests_per_second()),
                    wait.saturating_add(self.ctx.offset(&route.bucket_route)),
                ),
                None => {
                    let state = self.state();
                    (state.limit, state.time_to_reset(Instant::now()))
                }
            };

            let data = RateLimitData {
                global,
                method,
                url: url.to_string(),
                route: route.bucket_route.clone(),
                major_parameter: self.major_parameter.clone(),
                hash: self.hash.clone(),
                limit,
                time_to_reset: timeout,
                retry_after: timeout,
                sublimit_timeout: Duration::ZERO,
                scope: RateLimitScope::User,
            };
            self.ctx.events.emit(RestEvent::RateLimited(data.clone()));
            check_reject(&self.ctx.options.reject_on_rate_limit, &data)?;

            if global {
                self.debug(format!(
                    "Global rate limit hit, blocking all requests for {}ms",
                    timeout.as_millis()
                ));
                with_cancel(signal, self.ctx.global.delay_for(timeout)).await?;
            } else {
                self.debug(format!(
                    "Waiting {}ms for rate limit to pass",
                    timeout.as_millis()
                ));
                with_cancel(signal, tokio::time::sleep(timeout)).await?;
            }
        }
    }

    /// Stores the rate-limit headers of `response`.
    fn apply_headers(
        &self,
        route: &RouteDescriptor,
        method: RequestMethod,
        response: &TransportResponse,
    ) -> LimitUpdate {
        let headers = RateLimitHeaders::from_headers(&response.headers);
        let offset = self.ctx.offset(&route.bucket_route);
        let now = Instant::now();

        let local_limited = {
            let mut state = self.state();
            state.limit = headers.limit;
            state.remaining = headers.remaining;
            state.reset_at = Some(
                headers
                    .reset_after
                    .map_or(now, |r| deadline(now, r.saturating_add(offset))),
            );
            state.is_limited(now)
        };

        if let Some(bucket) = &headers.bucket {
            if self
                .ctx
                .record_bucket_hash(method, &route.bucket_route, bucket, &self.hash)
            {
                self.debug(format!(
                    "Bucket hash for {}:{} changed to {}",
                    method, route.bucket_route, bucket
                ));
            }
        }

        let retry_after = headers
            .retry_after
            .map_or(Duration::ZERO, |r| r.saturating_add(offset));
        let mut sublimit_timeout = None;
        if !retry_after.is_zero() {
            if headers.global {
                self.ctx.global.limit_for(retry_after);
            } else if !local_limited {
                sublimit_timeout = Some(retry_after);
            }
        }

        LimitUpdate {
            retry_after,
            sublimit_timeout,
            scope: headers.scope,
        }
    }

    /// Reports an unexpected 429, failing when the caller opted into
    /// rejection or the rate-limit retry budget is spent.
    fn on_too_many_requests(
        &self,
        route: &RouteDescriptor,
        url: &str,
        method: RequestMethod,
        update: LimitUpdate,
        hits: u32,
    ) -> Result<()> {
        let global = self.ctx.global.is_limited();
        let (limit, timeout) = if global {
            let offset = self.ctx.offset(&route.bucket_route);
            (
                Some(self.ctx.options.global_requests_per_second()),
                self.ctx.global.time_to_reset(offset),
            )
        } else {
            let state = self.state();
            (state.limit, state.time_to_reset(Instant::now()))
        };

        let data = RateLimitData {
            global,
            method,
            url: url.to_string(),
            route: route.bucket_route.clone(),
            major_parameter: self.major_parameter.clone(),
            hash: self.hash.clone(),
            limit,
            time_to_reset: timeout,
            retry_after: update.retry_after,
            sublimit_timeout: update.sublimit_timeout.unwrap_or_default(),
            scope: update.scope,
        };
        check_reject(&self.ctx.options.reject_on_rate_limit, &data)?;

        self.debug(format!(
            "Encountered unexpected 429 rate limit\n  Global         : {}\n  Method         : {}\n  URL            : {}\n  Bucket         : {}\n  Major parameter: {}\n  Hash           : {}\n  Limit          : {}\n  Retry After    : {}ms\n  Sublimit       : {}",
            global,
            method,
            url,
            route.bucket_route,
            self.major_parameter,
            self.hash,
            limit.map_or_else(|| "unlimited".to_string(), |l| l.to_string()),
            update.retry_after.as_millis(),
            update
                .sublimit_timeout
                .map_or_else(|| "None".to_string(), |t| format!("{}ms", t.as_millis())),
        ));

        if let Some(max) = self.ctx.options.rate_limit_retries() {
            if hits > max {
                return Err(RateLimitError { data }.into());
            }
        }
        Ok(())
    }

    /// Moves the request onto the sublimit lane if needed, then waits out
    /// the sublimit.
    async fn wait_out_sublimit<'a>(
        &'a self,
        lane: Lane<'a>,
        timeout: Duration,
        signal: Option<&CancellationToken>,
    ) -> Result<Lane<'a>> {
        let lane = match lane {
            Lane::Primary { guard } => {
                let membership = self.enter_sublimit();
                drop(guard);
                let guard =
                    with_cancel(signal, Arc::clone(&self.sublimit_lane).lock_owned()).await?;
                Lane::Sublimit {
                    _guard: guard,
                    _membership: membership,
                }
            }
            sublimit => sublimit,
        };
        self.debug(format!("Sublimit hit, waiting {}ms", timeout.as_millis()));
        with_cancel(signal, tokio::time::sleep(timeout)).await?;
        Ok(lane)
    }

    async fn run_request<'a>(
        &'a self,
        route: &RouteDescriptor,
        url: &str,
        request: &TransportRequest,
        data: &RequestData,
        mut lane: Lane<'a>,
    ) -> Result<TransportResponse> {
        let method = request.method;
        let signal = data.signal.as_ref();
        let mut retries = 0u32;
        let mut rate_limit_hits = 0u32;

        loop {
            let (response, update) = {
                let _dispatch = with_cancel(signal, self.dispatch.lock()).await?;
                self.acquire_slot(route, url, method, signal).await?;

                let Some(response) =
                    make_network_request(&self.ctx, route, url, request, data, retries).await?
                else {
                    retries += 1;
                    continue;
                };
                let update = self.apply_headers(route, method, &response);
                (response, update)
            };

            if is_invalid_status(response.status) {
                increment_invalid_count(&self.ctx);
            }

            if response.ok() {
                return Ok(response);
            }

            if response.status == 429 {
                rate_limit_hits += 1;
                self.on_too_many_requests(route, url, method, update, rate_limit_hits)?;
                if let Some(timeout) = update.sublimit_timeout {
                    lane = self.wait_out_sublimit(lane, timeout, signal).await?;
                }
                continue;
            }

            match handle_errors(&self.ctx, method, url, data, response, retries)? {
                Some(response) => return Ok(response),
                None => retries += 1,
            }
        }
    }
}

#[async_trait]
impl RequestHandler for SequentialHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn inactive(&self) -> bool {
        self.activity.in_flight() == 0 && !self.ctx.global.is_limited() && !self.local_limited()
    }

    fn activity(&self) -> &Arc<HandlerActivity> {
        &self.activity
    }

    async fn queue_request(
        &self,
        route: &RouteDescriptor,
        url: &str,
        request: TransportRequest,
        data: RequestData,
    ) -> Result<TransportResponse> {
        let signal = data.signal.as_ref();
        if signal.map_or(false, CancellationToken::is_cancelled) {
            return Err(RestError::Cancelled);
        }
        let sublimited = has_sublimit(&route.bucket_route, request.method, data.body.json.as_ref());

        let lane = if sublimited && self.sublimit_active() {
            self.join_sublimit_lane(signal).await?
        } else {
            let guard = with_cancel(signal, Arc::clone(&self.primary).lock_owned()).await?;
            if sublimited && self.sublimit_active() {
                drop(guard);
                self.join_sublimit_lane(signal).await?
            } else {
                Lane::Primary { guard }
            }
        };

        self.run_request(route, url, &request, &data, lane).await
    }
}

impl std::fmt::Debug for SequentialHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialHandler")
            .field("id", &self.id)
            .field("state", &*self.state())
            .field("in_flight", &self.activity.in_flight())
            .finish()
    }
}
