//! Port definitions (hexagonal architecture)
//!
//! Ports are the trait interfaces through which the scheduler reaches the
//! outside world. Adapter implementations live in `fantasy-rest` (the
//! `reqwest` transport) or in the embedding application.
//!
//! ## Ports
//!
//! - [`transport::ITransport`] - Executes a single HTTP exchange
//! - [`events::IRestEventListener`] - Receives observability events

pub mod events;
pub mod transport;
