//! Trait seams between the core and its collaborators.
//!
//! # Submodules
//!
//! - `hardware`: knob events and the encoder polling trait
//! - `network`: outbound throttle commands and connection supervision
//!
//! The controller is generic over [`ThrottleLink`] so it can be driven
//! against a mock in tests and the WiThrottle client in production. The
//! reconnect supervisor is generic over [`ManagedConnection`] and
//! [`NetworkMonitor`] for the same reason.

pub mod hardware;
pub mod network;

pub use hardware::*;
pub use network::*;
