//! Background services around the controller.
//!
//! - `bridge`: WiThrottle client events into the controller
//! - `timers`: heartbeat and periodic throttle polling
//! - `physical`: encoder polling into knob events
//! - `web` feature: Axum-based virtual knob panel with JSON endpoints
//!
//! Everything shares one `ThrottleController` through an `Arc`:
//!
//! ```ignore
//! let controller = Arc::new(ThrottleController::new(Arc::clone(&withrottle), &config.throttle));
//!
//! spawn_withrottle_bridge(withrottle.subscribe(), Arc::clone(&controller));
//! spawn_poll_loop(Arc::clone(&controller), config.throttle.poll_interval());
//! let router = build_router(Arc::new(WebState::new(controller, power)), &web_config);
//! ```

pub mod bridge;
pub mod physical;
pub mod timers;

// API types for the web panel
#[cfg(feature = "web")]
pub mod api;

#[cfg(feature = "web")]
pub mod web;

// Re-exports
pub use bridge::*;
pub use physical::*;
pub use timers::*;

#[cfg(feature = "web")]
pub use api::*;

#[cfg(feature = "web")]
pub use web::*;
