//! JMRI JSON protocol client (message-oriented, WebSocket).
//!
//! - [`envelope`] - `{type, data, method}` messages and the power payload
//! - [`client`] - async connection, greeting handshake, heartbeat and power cache

pub mod client;
pub mod envelope;

pub use client::{JmriJsonClient, JsonClientOptions, JsonEvent};
pub use envelope::{Envelope, PowerData};
