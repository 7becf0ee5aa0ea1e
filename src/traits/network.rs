//! Network-facing seams: outbound throttle commands and connection supervision.
//!
//! # Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`ThrottleLink`] | Commands the controller sends for a throttle slot |
//! | [`ManagedConnection`] | A protocol client the reconnect supervisor can restart |
//! | [`NetworkMonitor`] | Whether the local network is up at all |
//!
//! The WiThrottle client implements [`ThrottleLink`]; tests use
//! [`MockLink`](crate::hal::MockLink), which records every command.

use core::future::Future;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::locomotive::{Direction, LocoAddress};

// ============================================================================
// Throttle Link
// ============================================================================

/// Outbound commands for throttle slots.
///
/// The controller only calls these after releasing its state lock, so an
/// implementation may block on I/O for as long as its transport allows.
pub trait ThrottleLink: Send + Sync {
    /// True while commands can be sent.
    fn is_connected(&self) -> bool;

    /// Claims `address` for `throttle`.
    fn acquire(&self, throttle: u8, address: LocoAddress)
        -> impl Future<Output = Result<()>> + Send;

    /// Gives up whatever `throttle` holds.
    fn release(&self, throttle: u8) -> impl Future<Output = Result<()>> + Send;

    /// Sets speed (0..=126).
    fn set_speed(&self, throttle: u8, speed: u8) -> impl Future<Output = Result<()>> + Send;

    /// Sets direction.
    fn set_direction(
        &self,
        throttle: u8,
        direction: Direction,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Sets a decoder function.
    fn set_function(
        &self,
        throttle: u8,
        function: u8,
        on: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Asks the server to report speed.
    fn query_speed(&self, throttle: u8) -> impl Future<Output = Result<()>> + Send;

    /// Asks the server to report direction.
    fn query_direction(&self, throttle: u8) -> impl Future<Output = Result<()>> + Send;
}

// ============================================================================
// Supervision
// ============================================================================

/// A connection the reconnect supervisor can check and restart.
pub trait ManagedConnection: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// True while the connection is up.
    fn is_connected(&self) -> bool;

    /// Tears down whatever is left and connects again to `server`.
    fn reconnect(&self, server: &ServerConfig) -> impl Future<Output = Result<()>> + Send;
}

/// Reports whether the local network is usable.
pub trait NetworkMonitor: Send + Sync {
    /// True when the network link is up.
    fn is_network_up(&self) -> bool;
}

/// A network that is always considered up (desktop hosts).
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysUp;

impl NetworkMonitor for AlwaysUp {
    fn is_network_up(&self) -> bool {
        true
    }
}
