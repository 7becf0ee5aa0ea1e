//! Request and response types for the virtual panel HTTP API.

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionState, PowerState};

// ============================================================================
// Response Types
// ============================================================================

/// API response wrapper for consistent JSON structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (present when success=true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present when success=false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Power of the configured power manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerResponse {
    /// Power manager name
    pub name: String,
    /// Last reported state
    pub state: PowerState,
    /// JSON connection state
    pub connection: ConnectionState,
}

// ============================================================================
// Request Types
// ============================================================================

/// `POST /api/knobs/:id/rotate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateRequest {
    /// Signed detent clicks
    pub delta: i32,
}

/// `POST /api/throttles/:id/touch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchRequest {
    /// Knob doing the touching
    pub knob: u8,
}

/// `POST /api/power`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRequest {
    /// Desired power
    pub on: bool,
}

/// `POST /api/throttles/:id/functions/:number`
///
/// Without `on` the function is toggled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRequest {
    /// Desired state
    #[serde(default)]
    pub on: Option<bool>,
}
