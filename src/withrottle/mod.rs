//! WiThrottle protocol client (line-oriented, TCP).
//!
//! - [`codec`] - framing, command encoding and message parsing
//! - [`client`] - async connection, receive task and cached server state

pub mod client;
pub mod codec;

pub use client::{ClientOptions, Track, WiThrottleClient, WiThrottleEvent};
pub use codec::{Command, FunctionUpdate, Inbound, LineBuffer, ThrottleUpdate};
