//! Request handlers
//!
//! A handler owns the scheduling of every request that shares one
//! `(bucket hash, major parameter)` pair.
//!
//! - [`SequentialHandler`]: FIFO queue with local rate-limit state and a
//!   sublimit lane
//! - [`BurstHandler`]: no queue, every request is dispatched immediately
//! - [`shared`]: the single-attempt executor and error classification both
//!   handlers build on

mod burst;
mod sequential;
pub(crate) mod shared;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fantasy_core::domain::RouteDescriptor;
use fantasy_core::ports::transport::{RequestBodySummary, TransportRequest, TransportResponse};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use burst::BurstHandler;
pub use sequential::SequentialHandler;
pub use shared::InvalidRequestCounter;

use crate::Result;

/// Per-request data that travels with the transport request.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    /// What was sent, for errors, events and the sublimit check
    pub body: RequestBodySummary,
    /// Whether the request carried the stored token
    pub auth: bool,
    /// Caller-supplied cancellation
    pub signal: Option<CancellationToken>,
}

/// Schedules requests for one handler table entry.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `{hash}:{major parameter}`
    fn id(&self) -> &str;

    /// Whether the handler has nothing queued and is not rate limited.
    fn inactive(&self) -> bool;

    /// Request accounting used by the handler sweeper.
    fn activity(&self) -> &Arc<HandlerActivity>;

    /// Runs `request` to completion, honouring every applicable limit.
    async fn queue_request(
        &self,
        route: &RouteDescriptor,
        url: &str,
        request: TransportRequest,
        data: RequestData,
    ) -> Result<TransportResponse>;
}

// ============================================================================
// HandlerActivity
// ============================================================================

/// Tracks requests inside a handler and when it was last looked up.
#[derive(Debug)]
pub struct HandlerActivity {
    in_flight: AtomicUsize,
    last_touched: Mutex<Instant>,
}

impl HandlerActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            last_touched: Mutex::new(Instant::now()),
        })
    }

    /// Marks one request as entering the handler until the guard drops.
    pub fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        *self
            .last_touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        ActivityGuard(Arc::clone(self))
    }

    /// Requests queued or executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_touched(&self) -> Instant {
        *self
            .last_touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases one unit of [`HandlerActivity`] on drop.
#[derive(Debug)]
pub struct ActivityGuard(Arc<HandlerActivity>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
