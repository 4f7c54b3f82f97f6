//! HTTP control API.
//!
//! Every control endpoint is the same operation with a different command
//! name: dispatch to the device and wait for its answer.

use crate::metrics;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::reply::GET_STATUS;
use tether_core::{BridgeError, Device};
use tether_protocol::HeartbeatPayload;
use thiserror::Error;
use tracing::{info, warn};

/// Longest wait a caller may request.
const MAX_COMMAND_TIMEOUT_MS: u64 = 120_000;

/// Device control routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/register", post(register_device))
        .route("/api/devices/:id", get(get_device))
        .route("/api/devices/:id/heartbeat", post(heartbeat))
        .route("/api/devices/:id/status", get(device_status))
        .route("/api/devices/:id/on", post(turn_on))
        .route("/api/devices/:id/off", post(turn_off))
        .route("/api/devices/:id/voice/enable", post(enable_voice))
        .route("/api/devices/:id/voice/disable", post(disable_voice))
        .route("/api/devices/:id/commands/:command", post(custom_command))
}

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bridge-level failure.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Malformed request.
    #[error("{0}")]
    BadRequest(&'static str),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, *msg, None),
            ApiError::Bridge(err) => {
                let details = Some(err.to_string());
                match err {
                    BridgeError::InvalidDeviceId(_) => {
                        (StatusCode::BAD_REQUEST, "Invalid device id", details)
                    }
                    BridgeError::DeviceNotFound(_) => (StatusCode::NOT_FOUND, "Device not found", None),
                    BridgeError::DeviceOffline(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "Device is offline", None)
                    }
                    BridgeError::PublishFailure(_) => (
                        StatusCode::BAD_GATEWAY,
                        "Failed to communicate with device",
                        details,
                    ),
                    BridgeError::CommandFailure { message, .. } => (
                        StatusCode::BAD_GATEWAY,
                        "Device reported an error",
                        Some(message.clone()),
                    ),
                    BridgeError::Timeout { .. } => {
                        (StatusCode::GATEWAY_TIMEOUT, "Device did not respond", details)
                    }
                    BridgeError::DuplicateRequestId(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error", None)
                    }
                }
            }
        };

        (status, Json(ErrorBody { error, details })).into_response()
    }
}

/// Device fields echoed next to a command result.
#[derive(Serialize)]
struct DeviceSummary {
    id: String,
    name: Option<String>,
    status: Option<String>,
    online: bool,
}

impl From<Device> for DeviceSummary {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            name: device.name,
            status: device.status,
            online: device.online,
        }
    }
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "devices": state.bridge.list_devices() }))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    state
        .bridge
        .get_device(&id)
        .map(Json)
        .ok_or(ApiError::Bridge(BridgeError::DeviceNotFound(id)))
}

/// Registration body for devices that cannot publish.
#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "deviceId", default)]
    device_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    let (Some(device_id), Some(ip)) = (
        request.device_id.filter(|id| !id.is_empty()),
        request.ip.filter(|ip| !ip.is_empty()),
    ) else {
        return Err(ApiError::BadRequest("deviceId and ip are required"));
    };

    let mut heartbeat = HeartbeatPayload {
        device_id: Some(device_id.clone()),
        name: request.name,
        address: Some(ip.clone()),
        kind: Some("registration".to_string()),
        ..HeartbeatPayload::default()
    };
    heartbeat
        .extra
        .insert("port".to_string(), json!(request.port.unwrap_or(80)));

    state.bridge.presence().upsert(&device_id, &heartbeat)?;
    info!(device = %device_id, ip = %ip, "Device registered over HTTP");

    Ok(Json(json!({
        "message": "Device registered successfully",
        "deviceId": device_id,
    })))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.bridge.presence().touch(&id).is_none() {
        warn!(device = %id, "Heartbeat from unknown device");
        return Err(BridgeError::DeviceNotFound(id).into());
    }
    let device = state
        .bridge
        .get_device(&id)
        .ok_or_else(|| BridgeError::DeviceNotFound(id.clone()))?;

    Ok(Json(json!({
        "message": "Heartbeat received",
        "online": device.online,
        "lastSeen": device.last_seen,
    })))
}

/// Optional per-request timeout.
#[derive(Debug, Deserialize)]
struct CommandQuery {
    timeout_ms: Option<u64>,
}

async fn run_command(
    state: &AppState,
    device_id: &str,
    command: &str,
    timeout_ms: Option<u64>,
) -> Result<Json<Value>, ApiError> {
    let timeout = match timeout_ms {
        None => state.bridge.config().command_timeout,
        Some(ms) if ms == 0 || ms > MAX_COMMAND_TIMEOUT_MS => {
            return Err(ApiError::BadRequest("timeout_ms must be between 1 and 120000"))
        }
        Some(ms) => Duration::from_millis(ms),
    };

    let started = Instant::now();
    let outcome = state.bridge.dispatch(device_id, command, timeout).await;
    let label = match &outcome {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::record_dispatch(command, label, started.elapsed().as_secs_f64());

    let reply = outcome.map_err(|e| {
        metrics::record_error(e.kind());
        ApiError::from(e)
    })?;
    let device = state.bridge.get_device(device_id).map(DeviceSummary::from);

    Ok(Json(json!({
        "device": device,
        "result": reply,
    })))
}

async fn device_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    run_command(&state, &id, GET_STATUS, None).await
}

async fn turn_on(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    run_command(&state, &id, "turn_on", None).await
}

async fn turn_off(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    run_command(&state, &id, "turn_off", None).await
}

async fn enable_voice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    run_command(&state, &id, "enable_voice", None).await
}

async fn disable_voice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    run_command(&state, &id, "disable_voice", None).await
}

async fn custom_command(
    State(state): State<Arc<AppState>>,
    Path((id, command)): Path<(String, String)>,
    Query(query): Query<CommandQuery>,
) -> Result<Json<Value>, ApiError> {
    run_command(&state, &id, &command, query.timeout_ms).await
}
