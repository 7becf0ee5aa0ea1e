//! Axum-based HTTP server for the virtual knob panel.
//!
//! Provides REST endpoints for:
//! - GET `/api/throttles` - All throttle snapshots
//! - GET `/api/throttles/:id` - One throttle
//! - GET `/api/throttles/:id/functions` - Function states and labels
//! - POST `/api/throttles/:id/functions/:number` - Set or toggle a function
//! - POST `/api/throttles/:id/touch` - Point a knob at a throttle
//! - POST `/api/throttles/:id/release` - Release a throttle
//! - GET `/api/knobs` - Knob snapshots
//! - POST `/api/knobs/:id/rotate` - Turn a knob
//! - POST `/api/knobs/:id/press` - Press a knob
//! - GET `/api/selection` - Roster picker state
//! - GET `/api/roster` - Current roster
//! - GET/POST `/api/power` - Track power of the configured power manager

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::WebConfig;
use crate::controller::{
    FunctionSnapshot, KnobSnapshot, PressOutcome, ReleaseOutcome, RosterSelectionSnapshot,
    RotateOutcome, ThrottleController, ThrottleSnapshot, TouchOutcome,
};
use crate::error::{Error, Result};
use crate::jmri_json::JmriJsonClient;
use crate::roster::RosterEntry;
use crate::traits::ThrottleLink;

use super::api::{
    ApiResponse, FunctionRequest, PowerRequest, PowerResponse, RotateRequest, TouchRequest,
};

// ============================================================================
// Shared State
// ============================================================================

/// What the handlers operate on.
pub struct WebState<L: ThrottleLink> {
    /// Knob and throttle coordination
    pub controller: Arc<ThrottleController<L>>,
    /// Track power
    pub power: Arc<JmriJsonClient>,
}

impl<L: ThrottleLink> WebState<L> {
    /// Bundles the controller and power client.
    pub fn new(controller: Arc<ThrottleController<L>>, power: Arc<JmriJsonClient>) -> Self {
        Self { controller, power }
    }
}

type Shared<L> = State<Arc<WebState<L>>>;
type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidParameter(_) | Error::Malformed(_) | Error::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::NotConnected | Error::InvalidState(_) => StatusCode::CONFLICT,
        Error::LockTimeout | Error::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(result: Result<T>) -> Reply<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))),
        Err(e) => (status_for(&e), Json(ApiResponse::err(e.to_string()))),
    }
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| Error::InvalidParameter(e.to_string()))
}

fn parse_required<T: DeserializeOwned>(body: &Bytes, what: &str) -> Result<T> {
    serde_json::from_slice(body).map_err(|_| Error::InvalidParameter(format!("Invalid {what} request")))
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn list_throttles<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
) -> Reply<Vec<ThrottleSnapshot>> {
    reply(state.controller.throttle_snapshots().await)
}

async fn get_throttle<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path(id): Path<u8>,
) -> Reply<ThrottleSnapshot> {
    reply(state.controller.throttle_snapshot(id).await)
}

async fn get_functions<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path(id): Path<u8>,
) -> Reply<Vec<FunctionSnapshot>> {
    reply(state.controller.function_snapshot(id).await)
}

/// Body: `{"on": true}` to set, empty or `{}` to toggle.
async fn set_function<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path((id, number)): Path<(u8, u8)>,
    body: Bytes,
) -> Reply<bool> {
    let result = async {
        let request: FunctionRequest = parse_body(&body)?;
        let applied = match request.on {
            Some(on) => state
                .controller
                .set_function(id, number, on)
                .await?
                .then_some(on),
            None => state.controller.toggle_function(id, number).await?,
        };
        applied.ok_or_else(|| {
            Error::InvalidState(format!("throttle {id} has no function {number}"))
        })
    };
    reply(result.await)
}

async fn touch_throttle<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path(id): Path<u8>,
    body: Bytes,
) -> Reply<TouchOutcome> {
    let result = async {
        let request: TouchRequest = parse_required(&body, "touch")?;
        state.controller.on_knob_touch(id, request.knob).await
    };
    reply(result.await)
}

async fn release_throttle<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path(id): Path<u8>,
) -> Reply<ReleaseOutcome> {
    reply(state.controller.on_throttle_release(id).await)
}

async fn list_knobs<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
) -> Reply<Vec<KnobSnapshot>> {
    reply(state.controller.knob_snapshots().await)
}

async fn rotate_knob<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path(id): Path<u8>,
    body: Bytes,
) -> Reply<RotateOutcome> {
    let result = async {
        let request: RotateRequest = parse_required(&body, "rotate")?;
        state.controller.on_knob_rotate(id, request.delta).await
    };
    reply(result.await)
}

async fn press_knob<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    Path(id): Path<u8>,
) -> Reply<PressOutcome> {
    reply(state.controller.on_knob_press(id).await)
}

async fn get_selection<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
) -> Reply<RosterSelectionSnapshot> {
    reply(state.controller.roster_selection_snapshot().await)
}

async fn get_roster<L: ThrottleLink + 'static>(State(state): Shared<L>) -> Reply<Vec<RosterEntry>> {
    let result = state.controller.roster().await;
    reply(result.map(|roster| roster.entries().to_vec()))
}

fn power_response(power: &JmriJsonClient) -> PowerResponse {
    PowerResponse {
        name: power.configured_power_name(),
        state: power.power_state(),
        connection: power.state(),
    }
}

async fn get_power<L: ThrottleLink + 'static>(State(state): Shared<L>) -> Reply<PowerResponse> {
    reply(Ok(power_response(&state.power)))
}

async fn set_power<L: ThrottleLink + 'static>(
    State(state): Shared<L>,
    body: Bytes,
) -> Reply<PowerResponse> {
    let result = async {
        let request: PowerRequest = parse_required(&body, "power")?;
        state.power.set_power(request.on).await?;
        Ok::<_, Error>(power_response(&state.power))
    };
    reply(result.await)
}

/// Fallback handler for 404
async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::err("Not found")),
    )
}

// ============================================================================
// Server Builder
// ============================================================================

/// Configuration for the web server
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    /// Address to bind to
    pub addr: SocketAddr,
    /// Whether to enable CORS for all origins
    pub cors_permissive: bool,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self::from_config(&WebConfig::default())
    }
}

impl WebServerConfig {
    /// Create from shared WebConfig
    pub fn from_config(config: &WebConfig) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], config.port)),
            cors_permissive: config.cors_permissive,
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router<L: ThrottleLink + 'static>(
    state: Arc<WebState<L>>,
    config: &WebServerConfig,
) -> Router {
    let mut router = Router::new()
        .route("/api/throttles", get(list_throttles::<L>))
        .route("/api/throttles/:id", get(get_throttle::<L>))
        .route("/api/throttles/:id/functions", get(get_functions::<L>))
        .route("/api/throttles/:id/functions/:number", post(set_function::<L>))
        .route("/api/throttles/:id/touch", post(touch_throttle::<L>))
        .route("/api/throttles/:id/release", post(release_throttle::<L>))
        .route("/api/knobs", get(list_knobs::<L>))
        .route("/api/knobs/:id/rotate", post(rotate_knob::<L>))
        .route("/api/knobs/:id/press", post(press_knob::<L>))
        .route("/api/selection", get(get_selection::<L>))
        .route("/api/roster", get(get_roster::<L>))
        .route("/api/power", get(get_power::<L>).post(set_power::<L>))
        .fallback(not_found)
        .with_state(state);

    if config.cors_permissive {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router
}

/// Serves the panel until the listener fails.
pub async fn run_server<L: ThrottleLink + 'static>(
    state: Arc<WebState<L>>,
    config: WebServerConfig,
) -> std::io::Result<()> {
    let router = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!(addr = %config.addr, "web panel listening");

    axum::serve(listener, router).await
}
