//! HTTP telemetry API.
//!
//! Thin adapter translating requests into registry operations. Errors leave
//! as structured JSON bodies with the appropriate status code; nothing from
//! the upstream transport or its credentials ever appears in a response.
//!
//! All `/api/*` routes require the configured API key via the `X-API-Key`
//! header or an `api_key` query parameter; authentication is disabled
//! entirely when no key is configured. `/health` is always open so liveness
//! probes need no credentials.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::TelemetryError;
use crate::registry::{DeviceRegistry, RegisterOutcome, TelemetrySnapshot};

/// State shared across handlers.
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub api_key: Option<String>,
    pub default_device: Option<String>,
}

type AppStateArc = Arc<AppState>;

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);

    let api = Router::new()
        .route("/api/register-device", post(register_device))
        .route("/api/unregister-device/:device_id", delete(unregister_device))
        .route("/api/devices", get(list_devices))
        .route("/api/telemetry", get(telemetry_by_query))
        .route("/api/telemetry/:device_id", get(telemetry_by_path))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// API-visible failure; rendered as `{"error": ...}` with a status code.
enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal,
}

impl From<TelemetryError> for ApiError {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::DeviceNotFound(device_id) => {
                ApiError::NotFound(format!("device '{device_id}' is not registered"))
            }
            _ => ApiError::Internal,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "missing or invalid API key".to_string(),
            ),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// ============================================================================
// Authentication
// ============================================================================

async fn require_api_key(
    State(state): State<AppStateArc>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(request).await);
    };

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let query_key = request.uri().query().and_then(api_key_from_query);

    match header_key.or(query_key) {
        Some(presented) if presented == *expected => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}

fn api_key_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("api_key="))
        .map(str::to_string)
}

// ============================================================================
// Device lifecycle
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    device_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    device_id: String,
    status: &'static str,
    message: &'static str,
}

async fn register_device(
    State(state): State<AppStateArc>,
    body: Option<Json<RegisterRequest>>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let device_id = body
        .and_then(|Json(req)| req.device_id)
        .map(|id| id.trim().to_string())
        .unwrap_or_default();
    if device_id.is_empty() {
        return Err(ApiError::BadRequest("deviceId is required".to_string()));
    }

    let response = match state.registry.register(&device_id).await {
        RegisterOutcome::Created => RegisterResponse {
            device_id,
            status: "registering",
            message: "subscription opening; telemetry will appear once the device reports",
        },
        RegisterOutcome::AlreadyRegistered => RegisterResponse {
            device_id,
            status: "registered",
            message: "device was already registered",
        },
    };
    Ok(Json(response))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnregisterResponse {
    device_id: String,
    status: &'static str,
}

async fn unregister_device(
    State(state): State<AppStateArc>,
    Path(device_id): Path<String>,
) -> Result<Json<UnregisterResponse>, ApiError> {
    state.registry.unregister(&device_id).await?;
    Ok(Json(UnregisterResponse {
        device_id,
        status: "unregistered",
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo {
    device_id: String,
    registered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    status: &'static str,
    is_connected: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DevicesResponse {
    devices: Vec<DeviceInfo>,
    default_device: Option<String>,
}

async fn list_devices(State(state): State<AppStateArc>) -> Json<DevicesResponse> {
    let devices = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|status| DeviceInfo {
            device_id: status.device_id,
            registered_at: status.registered_at,
            last_seen: status.last_seen,
            status: if status.connected {
                "connected"
            } else {
                "registered"
            },
            is_connected: status.connected,
        })
        .collect();

    Json(DevicesResponse {
        devices,
        default_device: state.default_device.clone(),
    })
}

// ============================================================================
// Telemetry queries
// ============================================================================

#[derive(Deserialize)]
struct TelemetryParams {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryResponse {
    device_id: String,
    timestamp: Option<DateTime<Utc>>,
    is_connected: bool,
    voltages: Vec<Option<f64>>,
    currents: Vec<Option<f64>>,
    frequency: Vec<Option<f64>>,
    power: Vec<Option<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

impl From<TelemetrySnapshot> for TelemetryResponse {
    fn from(snapshot: TelemetrySnapshot) -> Self {
        match snapshot.reading {
            Some(reading) => TelemetryResponse {
                device_id: snapshot.device_id,
                timestamp: Some(reading.captured_at),
                is_connected: snapshot.connected,
                voltages: reading.voltages(),
                currents: reading.currents(),
                frequency: reading.frequencies(),
                power: reading.powers(),
                message: None,
            },
            None => TelemetryResponse {
                device_id: snapshot.device_id,
                timestamp: None,
                is_connected: snapshot.connected,
                voltages: Vec::new(),
                currents: Vec::new(),
                frequency: Vec::new(),
                power: Vec::new(),
                message: Some("no telemetry received from this device yet"),
            },
        }
    }
}

async fn telemetry_by_path(
    State(state): State<AppStateArc>,
    Path(device_id): Path<String>,
) -> Result<Json<TelemetryResponse>, ApiError> {
    let snapshot = state.registry.telemetry(&device_id).await?;
    Ok(Json(snapshot.into()))
}

async fn telemetry_by_query(
    State(state): State<AppStateArc>,
    Query(params): Query<TelemetryParams>,
) -> Result<Json<TelemetryResponse>, ApiError> {
    let device_id = params
        .device_id
        .unwrap_or_default();
    if device_id.is_empty() {
        return Err(ApiError::BadRequest(
            "deviceId query parameter is required".to_string(),
        ));
    }
    let snapshot = state.registry.telemetry(&device_id).await?;
    Ok(Json(snapshot.into()))
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    devices: usize,
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        devices: state.registry.len().await,
    })
}
