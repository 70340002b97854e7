//! Domain types for request scheduling
//!
//! - [`route`] - HTTP methods and the route classifier that maps a concrete
//!   endpoint to its rate-limit bucket
//! - [`rate_limit`] - the rate-limit record shared by events and errors

pub mod rate_limit;
pub mod route;

pub use rate_limit::{RateLimitData, RateLimitScope};
pub use route::{RequestMethod, RouteDescriptor, BURST_MAJOR_PARAMETER};
