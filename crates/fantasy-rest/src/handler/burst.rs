//! Burst handler
//!
//! Used for burst-exempt routes. Requests are dispatched as soon as the
//! global budget allows, with no ordering between them and no local bucket
//! state. A 429 is waited out and the request retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fantasy_core::domain::{RateLimitData, RequestMethod, RouteDescriptor};
use fantasy_core::ports::events::RestEvent;
use fantasy_core::ports::transport::{TransportRequest, TransportResponse};
use tokio_util::sync::CancellationToken;

use super::shared::{
    handle_errors, increment_invalid_count, is_invalid_status, make_network_request, with_cancel,
};
use super::{HandlerActivity, RequestData, RequestHandler};
use crate::errors::RateLimitError;
use crate::manager::RestContext;
use crate::rate_limit::{check_reject, RateLimitHeaders};
use crate::{RestError, Result};

/// Queue-free handler for burst-exempt routes.
pub struct BurstHandler {
    id: String,
    hash: String,
    major_parameter: String,
    ctx: Arc<RestContext>,
    activity: Arc<HandlerActivity>,
}

impl BurstHandler {
    pub fn new(ctx: Arc<RestContext>, hash: &str, major_parameter: &str) -> Self {
        Self {
            id: format!("{}:{}", hash, major_parameter),
            hash: hash.to_string(),
            major_parameter: major_parameter.to_string(),
            ctx,
            activity: HandlerActivity::new(),
        }
    }

    fn debug(&self, message: impl AsRef<str>) {
        self.ctx
            .events
            .emit(RestEvent::Debug(format!("[REST {}] {}", self.id, message.as_ref())));
    }

    fn rate_limit_data(
        &self,
        route: &RouteDescriptor,
        url: &str,
        method: RequestMethod,
        global: bool,
        time_to_reset: Duration,
    ) -> RateLimitData {
        RateLimitData {
            global,
            method,
            url: url.to_string(),
            route: route.bucket_route.clone(),
            major_parameter: self.major_parameter.clone(),
            hash: self.hash.clone(),
            limit: global.then(|| self.ctx.options.global_requests_per_second()),
            time_to_reset,
            retry_after: time_to_reset,
            sublimit_timeout: Duration::ZERO,
            scope: Default::default(),
        }
    }

    /// Takes a slot from the global budget, waiting while it is exhausted.
    async fn reserve_global(
        &self,
        route: &RouteDescriptor,
        url: &str,
        method: RequestMethod,
        signal: Option<&CancellationToken>,
    ) -> Result<()> {
        loop {
            let wait = match self.ctx.global.try_reserve() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let timeout = wait.saturating_add(self.ctx.offset(&route.bucket_route));
            let data = self.rate_limit_data(route, url, method, true, timeout);
            self.ctx.events.emit(RestEvent::RateLimited(data.clone()));
            check_reject(&self.ctx.options.reject_on_rate_limit, &data)?;

            self.debug(format!(
                "Global rate limit hit, blocking all requests for {}ms",
                timeout.as_millis()
            ));
            with_cancel(signal, self.ctx.global.delay_for(timeout)).await?;
        }
    }

    async fn run_request(
        &self,
        route: &RouteDescriptor,
        url: &str,
        request: &TransportRequest,
        data: &RequestData,
    ) -> Result<TransportResponse> {
        let method = request.method;
        let signal = data.signal.as_ref();
        let mut retries = 0u32;
        let mut rate_limit_hits = 0u32;

        loop {
            self.reserve_global(route, url, method, signal).await?;

            let Some(response) =
                make_network_request(&self.ctx, route, url, request, data, retries).await?
            else {
                retries += 1;
                continue;
            };

            if is_invalid_status(response.status) {
                increment_invalid_count(&self.ctx);
            }
            if response.ok() {
                return Ok(response);
            }

            if response.status == 429 {
                rate_limit_hits += 1;
                let headers = RateLimitHeaders::from_headers(&response.headers);
                let offset = self.ctx.offset(&route.bucket_route);
                let retry_after = headers
                    .retry_after
                    .map_or(Duration::ZERO, |r| r.saturating_add(offset));
                if headers.global && !retry_after.is_zero() {
                    self.ctx.global.limit_for(retry_after);
                }

                let mut data =
                    self.rate_limit_data(route, url, method, headers.global, retry_after);
                data.scope = headers.scope;
                check_reject(&self.ctx.options.reject_on_rate_limit, &data)?;
                if let Some(max) = self.ctx.options.rate_limit_retries() {
                    if rate_limit_hits > max {
                        return Err(RateLimitError { data }.into());
                    }
                }

                self.debug(format!(
                    "Encountered unexpected 429 rate limit on {} {}, retrying after {}ms",
                    method,
                    route.bucket_route,
                    retry_after.as_millis()
                ));
                with_cancel(signal, tokio::time::sleep(retry_after)).await?;
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
impl RequestHandler for BurstHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn inactive(&self) -> bool {
        self.activity.in_flight() == 0
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
        if data
            .signal
            .as_ref()
            .map_or(false, CancellationToken::is_cancelled)
        {
            return Err(RestError::Cancelled);
        }
        self.run_request(route, url, &request, &data).await
    }
}

impl std::fmt::Debug for BurstHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurstHandler")
            .field("id", &self.id)
            .field("in_flight", &self.activity.in_flight())
            .finish()
    }
}
