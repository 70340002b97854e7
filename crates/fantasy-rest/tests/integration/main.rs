//! Integration tests for fantasy-rest
//!
//! Scheduling behaviour is verified against a scripted in-memory transport
//! under paused Tokio time; the `reqwest` transport and error decoding are
//! verified end to end against a wiremock server.

mod common;

mod test_rate_limits;
mod test_sweepers;
