//! Listener registry
//!
//! Fans [`RestEvent`]s out to registered listeners and mirrors each one
//! into `tracing`, so events are visible in logs even with no listener.

use std::sync::{Arc, PoisonError, RwLock};

use fantasy_core::ports::events::{IRestEventListener, RestEvent};
use tracing::{debug, info, trace, warn};

#[derive(Default)]
pub struct EventEmitter {
    listeners: RwLock<Vec<Arc<dyn IRestEventListener>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn IRestEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Whether anyone is listening; callers use it to skip building
    /// expensive payloads.
    pub fn has_listeners(&self) -> bool {
        !self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn emit(&self, event: RestEvent) {
        log_event(&event);

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    /// Shorthand for [`RestEvent::Debug`].
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(RestEvent::Debug(message.into()));
    }
}

fn log_event(event: &RestEvent) {
    match event {
        RestEvent::Debug(message) => debug!("{}", message),
        RestEvent::Response(response) => trace!(
            method = %response.method,
            route = %response.route,
            status = response.status,
            retries = response.retries,
            "Response received"
        ),
        RestEvent::RateLimited(data) => info!(
            route = %data.route,
            hash = %data.hash,
            global = data.global,
            time_to_reset_ms = data.time_to_reset.as_millis() as u64,
            "Rate limited"
        ),
        RestEvent::InvalidRequestWarning(warning) => warn!(
            count = warning.count,
            remaining_ms = warning.remaining_time.as_millis() as u64,
            "Too many invalid requests"
        ),
        RestEvent::HashSweep(swept) => debug!(count = swept.len(), "Swept bucket hashes"),
        RestEvent::HandlerSweep(swept) => debug!(count = swept.len(), "Swept inactive handlers"),
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("has_listeners", &self.has_listeners())
            .finish()
    }
}
