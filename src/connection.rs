//! Connection and power state shared by both protocol clients.

use serde::{Deserialize, Serialize};

/// Lifecycle of a protocol connection.
///
/// `Disconnected` and `Failed` are both terminal until the next `connect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Transport is being established.
    Connecting,
    /// Transport is up.
    Connected,
    /// The last connect attempt or the live connection failed.
    Failed,
}

impl ConnectionState {
    /// Lowercase name for logs and APIs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }

    /// True while a connection is up or being set up.
    pub const fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Track power as last reported by a server.
///
/// Each protocol has its own numeric convention; conversions live next to
/// the codec that uses them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Not reported yet, or an unrecognized value.
    #[default]
    Unknown,
    /// Track powered.
    On,
    /// Track unpowered.
    Off,
}

impl PowerState {
    /// Uppercase name, as shown on the handheld.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PowerState::Unknown => "UNKNOWN",
            PowerState::On => "ON",
            PowerState::Off => "OFF",
        }
    }
}
