//! Axum-based HTTP server for the bridge API.
//!
//! Provides REST endpoints for:
//! - GET `/api/status` - Backend, connection and power state
//! - POST `/api/connect`, `/api/disconnect` - Connection lifecycle
//! - POST `/api/power` - Track power `{"on": true}`
//! - POST `/api/estop` - Emergency stop
//! - POST `/api/locos/:address/speed` - `{"speed": 40, "protocol": "dcc"}`
//! - POST `/api/locos/:address/direction` - `{"direction": "forward"}`
//! - POST `/api/locos/:address/functions/:number` - `{"on": true}`
//! - POST `/api/accessories/:address` - `{"value": "green"}`
//! - GET `/api/feedback/:module` - Raw feedback module read
//! - GET `/api/sensors/:id` - Committed sensor state
//! - GET `/api/measurements` - Measurement readings
//! - GET `/api/devices` - Discovered modules
//! - GET `/api/events?since=N` - Journaled events after sequence `N`
//!
//! Station operations may block on the dispatcher, so handlers run them on
//! the blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::WebConfig;
use crate::device::{Device, Measurement};

use super::api::{
    AccessoryRequest, ApiResponse, CommandResponse, DirectionRequest, FeedbackResponse,
    FunctionRequest, PowerRequest, SensorResponse, SpeedRequest, StatusResponse,
};
use super::shared::{JournalEntry, SharedStation};

type Shared = State<Arc<SharedStation>>;

// ============================================================================
// Helpers
// ============================================================================

/// Run a station operation on the blocking pool.
async fn blocking<R, F>(state: Arc<SharedStation>, f: F) -> Option<R>
where
    R: Send + 'static,
    F: FnOnce(&SharedStation) -> R + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&state)).await {
        Ok(result) => Some(result),
        Err(e) => {
            tracing::error!(error = %e, "station task failed");
            None
        }
    }
}

fn parse<T: DeserializeOwned>(body: &Bytes, what: &str) -> Result<T, Json<ApiResponse<CommandResponse>>> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, what, "rejecting request body");
        Json(ApiResponse::err(format!("Invalid {what} request")))
    })
}

fn outcome(result: Option<bool>, label: &str) -> Json<ApiResponse<CommandResponse>> {
    match result {
        Some(accepted) => Json(ApiResponse::ok(CommandResponse::from_outcome(accepted, label))),
        None => Json(ApiResponse::err("Station task failed")),
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// GET /api/status
async fn get_status(State(state): Shared) -> Json<ApiResponse<StatusResponse>> {
    Json(ApiResponse::ok(StatusResponse::from(state.as_ref())))
}

/// POST /api/connect
async fn connect(State(state): Shared) -> Json<ApiResponse<CommandResponse>> {
    outcome(blocking(state, |s| s.connect()).await, "connected")
}

/// POST /api/disconnect
async fn disconnect(State(state): Shared) -> Json<ApiResponse<CommandResponse>> {
    let done = blocking(state, |s| {
        s.disconnect();
        true
    })
    .await;
    outcome(done, "disconnected")
}

/// POST /api/power
async fn set_power(State(state): Shared, body: Bytes) -> Json<ApiResponse<CommandResponse>> {
    let req: PowerRequest = match parse(&body, "power") {
        Ok(req) => req,
        Err(e) => return e,
    };
    let label = if req.on { "power_on" } else { "power_off" };
    outcome(blocking(state, move |s| s.station().power(req.on)).await, label)
}

/// POST /api/estop
async fn emergency_stop(State(state): Shared) -> Json<ApiResponse<CommandResponse>> {
    outcome(
        blocking(state, |s| s.station().emergency_stop()).await,
        "emergency_stop",
    )
}

/// POST /api/locos/:address/speed
async fn set_speed(
    State(state): Shared,
    Path(address): Path<u32>,
    body: Bytes,
) -> Json<ApiResponse<CommandResponse>> {
    let req: SpeedRequest = match parse(&body, "speed") {
        Ok(req) => req,
        Err(e) => return e,
    };
    let sent = blocking(state, move |s| {
        s.station().change_velocity(address, req.protocol, req.speed);
        s.station().is_connected()
    })
    .await;
    outcome(sent, "speed_set")
}

/// POST /api/locos/:address/direction
async fn set_direction(
    State(state): Shared,
    Path(address): Path<u32>,
    body: Bytes,
) -> Json<ApiResponse<CommandResponse>> {
    let req: DirectionRequest = match parse(&body, "direction") {
        Ok(req) => req,
        Err(e) => return e,
    };
    let sent = blocking(state, move |s| {
        s.station().change_direction(address, req.protocol, req.direction);
        s.station().is_connected()
    })
    .await;
    outcome(sent, "direction_set")
}

/// POST /api/locos/:address/functions/:number
async fn set_function(
    State(state): Shared,
    Path((address, number)): Path<(u32, u8)>,
    body: Bytes,
) -> Json<ApiResponse<CommandResponse>> {
    let req: FunctionRequest = match parse(&body, "function") {
        Ok(req) => req,
        Err(e) => return e,
    };
    let sent = blocking(state, move |s| {
        s.station()
            .change_function_value(address, req.protocol, number, req.on);
        s.station().is_connected()
    })
    .await;
    outcome(sent, "function_set")
}

/// POST /api/accessories/:address
async fn switch_accessory(
    State(state): Shared,
    Path(address): Path<u32>,
    body: Bytes,
) -> Json<ApiResponse<CommandResponse>> {
    let req: AccessoryRequest = match parse(&body, "accessory") {
        Ok(req) => req,
        Err(e) => return e,
    };
    let sent = blocking(state, move |s| {
        s.station()
            .switch_accessory(address, req.protocol, req.value, req.switch_time_ms);
        s.station().is_connected()
    })
    .await;
    outcome(sent, "accessory_switched")
}

/// GET /api/feedback/:module
async fn get_feedback(
    State(state): Shared,
    Path(module): Path<u16>,
) -> Json<ApiResponse<FeedbackResponse>> {
    match blocking(state, move |s| s.station().get_feedback(module)).await {
        Some(Some(bytes)) => Json(ApiResponse::ok(FeedbackResponse::new(module, bytes))),
        _ => Json(ApiResponse::err("Feedback unavailable")),
    }
}

/// GET /api/sensors/:id
async fn get_sensor(State(state): Shared, Path(id): Path<u32>) -> Json<ApiResponse<SensorResponse>> {
    match state.station().sensor_state(id) {
        Some(sensor) => Json(ApiResponse::ok(SensorResponse::new(id, &sensor))),
        None => Json(ApiResponse::err("Unknown sensor")),
    }
}

/// GET /api/measurements
async fn get_measurements(State(state): Shared) -> Json<ApiResponse<Vec<Measurement>>> {
    match blocking(state, |s| s.station().measurements()).await {
        Some(readings) => Json(ApiResponse::ok(readings)),
        None => Json(ApiResponse::err("Station task failed")),
    }
}

/// GET /api/devices
async fn get_devices(State(state): Shared) -> Json<ApiResponse<Vec<Device>>> {
    Json(ApiResponse::ok(state.station().devices()))
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: u64,
}

/// GET /api/events
async fn get_events(
    State(state): Shared,
    Query(query): Query<EventsQuery>,
) -> Json<ApiResponse<Vec<JournalEntry>>> {
    Json(ApiResponse::ok(state.journal().since(query.since)))
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
    /// Create a new config with the given address
    pub fn new(addr: impl Into<SocketAddr>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Set whether CORS should be permissive
    pub fn cors(mut self, permissive: bool) -> Self {
        self.cors_permissive = permissive;
        self
    }

    /// Create from shared WebConfig
    pub fn from_config(config: &WebConfig) -> Self {
        Self {
            addr: ([0, 0, 0, 0], config.port).into(),
            cors_permissive: config.cors_permissive,
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: Arc<SharedStation>, config: &WebServerConfig) -> Router {
    let mut router = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/connect", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/power", post(set_power))
        .route("/api/estop", post(emergency_stop))
        .route("/api/locos/:address/speed", post(set_speed))
        .route("/api/locos/:address/direction", post(set_direction))
        .route("/api/locos/:address/functions/:number", post(set_function))
        .route("/api/accessories/:address", post(switch_accessory))
        .route("/api/feedback/:module", get(get_feedback))
        .route("/api/sensors/:id", get(get_sensor))
        .route("/api/measurements", get(get_measurements))
        .route("/api/devices", get(get_devices))
        .route("/api/events", get(get_events))
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

/// Start the web server with shared state.
///
/// Runs until `shutdown` resolves.
pub async fn run_server(
    state: Arc<SharedStation>,
    config: WebServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!(address = %config.addr, "web server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
