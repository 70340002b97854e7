//! Fantasy Core - Domain types, configuration and ports
//!
//! This crate holds everything the REST scheduler needs that does not
//! perform network I/O:
//! - **Configuration** - typed YAML configuration with defaults and validation
//! - **Domain** - `RequestMethod`, `RouteDescriptor` (route classification),
//!   and the `RateLimitData` record
//! - **Ports** - traits for adapters: `ITransport` (the HTTP strategy) and
//!   `IRestEventListener` (observability)
//!
//! # Architecture
//!
//! The domain module is pure: classifying a route has no side effects.
//! Ports define the trait interfaces that `fantasy-rest` drives, so the
//! concrete HTTP stack can be swapped for tests or other runtimes.

pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
