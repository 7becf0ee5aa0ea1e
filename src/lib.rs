//! # rs-knobcab
//!
//! A two-knob handheld cab for JMRI layouts. Two rotary knobs drive four
//! virtual throttle slots over the WiThrottle protocol, while the JMRI JSON
//! WebSocket protocol reports and switches track power.
//!
//! ## Features
//!
//! - **WiThrottle client**: line-oriented TCP client with roster, acquisition, speed, direction and function commands
//! - **JMRI JSON client**: WebSocket power-manager tracking with heartbeat
//! - **Knob/throttle engine**: touch-to-assign rules, roster browsing, signed speed across zero
//! - **Reconnect supervision**: exponential backoff over both connections
//! - **Virtual panel**: optional HTTP API standing in for the physical knobs (`web` feature)
//!
//! ## Architecture
//!
//! The crate is structured to allow testing on desktop without a layout server:
//!
//! - `locomotive`, `roster`, `throttle`, `knob` - the data model
//! - `withrottle`, `jmri_json` - the two protocol clients
//! - `controller` - coordination core behind one lock
//! - `supervisor` - reconnect policy
//! - `traits` - seams between the core and the network or hardware
//! - `hal` - mock implementations of those seams
//! - `services` - background tasks and the web panel
//! - `context` - the top-level owner of everything above
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_knobcab::{
//!     config::ThrottleConfig,
//!     hal::{LinkCommand, MockLink},
//!     roster::{Roster, RosterEntry},
//!     AddressType, Direction, ThrottleController,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let link = Arc::new(MockLink::new());
//! let controller = ThrottleController::new(Arc::clone(&link), &ThrottleConfig::default());
//!
//! let (roster, _) = Roster::from_entries([RosterEntry::new("Big Boy", 4014, AddressType::Long)]);
//! controller.on_roster(roster).await.unwrap();
//!
//! // Point knob 0 at throttle 2, pick the first roster entry, then turn it
//! controller.on_knob_touch(2, 0).await.unwrap();
//! controller.on_knob_press(0).await.unwrap();
//! controller.on_knob_rotate(0, -3).await.unwrap();
//!
//! let snapshot = controller.throttle_snapshot(2).await.unwrap();
//! assert_eq!(snapshot.speed, 12);
//! assert_eq!(snapshot.direction, Direction::Reverse);
//! assert!(matches!(link.commands().last(), Some(LinkCommand::Speed(2, 12))));
//! # });
//! ```

#![warn(missing_docs)]

/// Shared configuration and the settings store.
pub mod config;
/// Connection and power state shared by both protocol clients.
pub mod connection;
/// Explicit top-level application context.
pub mod context;
/// Knob and throttle coordination.
pub mod controller;
/// Crate error type.
pub mod error;
/// Mock implementations for testing.
pub mod hal;
/// JMRI JSON WebSocket client.
pub mod jmri_json;
/// Physical knob model.
pub mod knob;
/// Locomotive, address and direction types.
pub mod locomotive;
/// Server-provided roster.
pub mod roster;
/// Background services and the web panel.
pub mod services;
/// Reconnect supervision.
pub mod supervisor;
/// Throttle slot model.
pub mod throttle;
/// Seams between the core and the network or hardware.
pub mod traits;
/// WiThrottle TCP client.
pub mod withrottle;

// Re-exports for convenience
pub use connection::{ConnectionState, PowerState};
pub use context::AppContext;
pub use controller::{
    PressOutcome, ReleaseOutcome, RotateOutcome, ThrottleController, ThrottleSnapshot,
    TouchOutcome,
};
pub use error::{Error, Result};
pub use knob::{Knob, KnobState};
pub use locomotive::{AddressType, Direction, LocoAddress, Locomotive};
pub use roster::{Roster, RosterEntry};
pub use supervisor::{ReconnectSupervisor, TickOutcome};
pub use throttle::{Throttle, ThrottleState};
pub use traits::{EncoderInput, KnobEvent, ManagedConnection, NetworkMonitor, ThrottleLink};

// Config re-exports
pub use config::{Config, DeviceConfig, ReconnectConfig, ServerConfig, ThrottleConfig, WebConfig};

// Client re-exports
pub use jmri_json::{JmriJsonClient, JsonEvent};
pub use withrottle::{WiThrottleClient, WiThrottleEvent};
