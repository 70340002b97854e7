//! Global throttle
//!
//! The API-wide request budget, shared by every handler of a manager. The
//! budget is refilled one second after the first reservation of a window.
//! Handlers that find it exhausted all wait on a single shared delay rather
//! than arming one timer each.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::rate_limit::deadline;

const WINDOW: Duration = Duration::from_secs(1);

/// A delay every globally limited handler can await.
pub type GlobalDelay = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct GlobalState {
    remaining: i64,
    reset_at: Option<Instant>,
    delay: Option<GlobalDelay>,
}

/// Request budget shared across all buckets.
pub struct GlobalThrottle {
    requests_per_second: i64,
    state: Arc<Mutex<GlobalState>>,
}

impl GlobalThrottle {
    pub fn new(requests_per_second: u32) -> Self {
        let requests_per_second = i64::from(requests_per_second.max(1));
        Self {
            requests_per_second,
            state: Arc::new(Mutex::new(GlobalState {
                remaining: requests_per_second,
                ..GlobalState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the budget is exhausted and the window has not yet rolled over.
    pub fn is_limited(&self) -> bool {
        let state = self.lock();
        state.remaining <= 0 && state.reset_at.map_or(false, |r| Instant::now() < r)
    }

    /// Requests left in the current window.
    pub fn remaining(&self) -> i64 {
        self.lock().remaining
    }

    /// Time until the window resets, plus `offset`.
    pub fn time_to_reset(&self, offset: Duration) -> Duration {
        match self.lock().reset_at {
            Some(reset_at) => deadline(reset_at, offset).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Takes one request from the budget.
    ///
    /// The check, the window rollover and the decrement happen under one
    /// lock. Fails with the time left in the window when the budget is spent.
    pub fn try_reserve(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.reset_at {
            Some(reset_at) if now < reset_at => {
                if state.remaining <= 0 {
                    return Err(reset_at - now);
                }
            }
            _ => {
                state.reset_at = Some(deadline(now, WINDOW));
                state.remaining = self.requests_per_second;
            }
        }
        state.remaining -= 1;
        Ok(())
    }

    /// Exhausts the budget until `retry_after` from now, after a global 429.
    pub fn limit_for(&self, retry_after: Duration) {
        let mut state = self.lock();
        state.remaining = 0;
        state.reset_at = Some(deadline(Instant::now(), retry_after));
        debug!(retry_after_ms = retry_after.as_millis() as u64, "Global rate limit engaged");
    }

    /// Returns the shared delay, arming it for `timeout` if none is pending.
    ///
    /// The delay clears itself from the throttle once it fires.
    pub fn delay_for(&self, timeout: Duration) -> GlobalDelay {
        let mut state = self.lock();
        if let Some(delay) = &state.delay {
            return delay.clone();
        }

        let fires_at = deadline(Instant::now(), timeout);
        let shared_state = Arc::clone(&self.state);
        let delay = async move {
            sleep_until(fires_at).await;
            shared_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .delay = None;
        }
        .boxed()
        .shared();
        state.delay = Some(delay.clone());
        delay
    }

    /// Whether a shared delay is currently armed.
    pub fn has_pending_delay(&self) -> bool {
        self.lock().delay.is_some()
    }
}

impl std::fmt::Debug for GlobalThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("GlobalThrottle")
            .field("requests_per_second", &self.requests_per_second)
            .field("remaining", &state.remaining)
            .field("reset_at", &state.reset_at)
            .field("delay_pending", &state.delay.is_some())
            .finish()
    }
}
