//! HTTP query surface over a running engine.
//!
//! Read-mostly: device health, active threats, statistics and threat
//! signatures, plus the two operator actions (registering a threat signature
//! and marking an event as a false positive).

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use thermoguard_core::{
    DeviceHealth, EngineStatistics, GuardError, NewThreatSignature, SecurityEngine, SecurityEvent, Severity,
    ThreatSignature,
};

/// Shared server state.
struct AppState {
    engine: Arc<SecurityEngine>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

fn error_response(err: GuardError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        GuardError::UnknownEvent(_) | GuardError::NotEnrolled(_) | GuardError::NotBaselined { .. } => {
            StatusCode::NOT_FOUND
        }
        GuardError::InvalidDevice(_) | GuardError::InvalidOperation(_) | GuardError::InvalidConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        GuardError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: err.to_string(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            success: false,
            error: message.into(),
        }),
    )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sensor: String,
    events: usize,
    active_monitors: usize,
}

#[derive(Debug, Default, Deserialize)]
struct ThreatParams {
    severity: Option<String>,
}

#[derive(Debug, Serialize)]
struct ThreatsResponse {
    threats: Vec<SecurityEvent>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct SignaturesResponse {
    signatures: Vec<ThreatSignature>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct CorrelateRequest {
    pattern: serde_json::Value,
    #[serde(default = "default_window_minutes")]
    window_minutes: i64,
    #[serde(default = "default_similarity_threshold")]
    similarity_threshold: f64,
}

fn default_window_minutes() -> i64 {
    60
}

fn default_similarity_threshold() -> f64 {
    0.8
}

#[derive(Debug, Serialize)]
struct CorrelateResponse {
    events: Vec<SecurityEvent>,
    devices: Vec<String>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct FalsePositiveResponse {
    success: bool,
    event_id: String,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.engine.statistics();
    Json(HealthResponse {
        status: "ok",
        version: thermoguard_core::VERSION,
        sensor: stats.sensor,
        events: stats.registry.total_events,
        active_monitors: stats.power.active_monitors.len() + stats.thermal.active_monitors.len(),
    })
}

async fn handle_device_health(State(state): State<Arc<AppState>>, Path(device): Path<String>) -> Json<DeviceHealth> {
    Json(state.engine.registry().get_device_security_health(&device))
}

async fn handle_threats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ThreatParams>,
) -> ApiResult<ThreatsResponse> {
    let severity = match params.severity.as_deref() {
        None | Some("") => None,
        Some(s) => Some(s.parse::<Severity>().map_err(bad_request)?),
    };
    let threats = state.engine.registry().get_active_threats(severity);
    let total = threats.len();
    Ok(Json(ThreatsResponse { threats, total }))
}

async fn handle_statistics(State(state): State<Arc<AppState>>) -> Json<EngineStatistics> {
    Json(state.engine.statistics())
}

async fn handle_list_signatures(State(state): State<Arc<AppState>>) -> Json<SignaturesResponse> {
    let signatures = state.engine.registry().list_threat_signatures();
    let total = signatures.len();
    Json(SignaturesResponse { signatures, total })
}

async fn handle_register_signature(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewThreatSignature>,
) -> Result<(StatusCode, Json<ThreatSignature>), (StatusCode, Json<ErrorResponse>)> {
    if new.threat_type.trim().is_empty() {
        return Err(bad_request("threat_type must not be empty"));
    }
    let signature = state
        .engine
        .registry()
        .register_threat_signature(new)
        .await
        .map_err(error_response)?;
    log::info!("threat signature {} registered for {}", signature.signature_id, signature.threat_type);
    Ok((StatusCode::CREATED, Json(signature)))
}

async fn handle_correlate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CorrelateRequest>,
) -> ApiResult<CorrelateResponse> {
    if !(0.0..=1.0).contains(&request.similarity_threshold) {
        return Err(bad_request("similarity_threshold must be within [0, 1]"));
    }
    let events = state.engine.registry().correlate_threats(
        &request.pattern,
        request.window_minutes,
        request.similarity_threshold,
    );
    let mut devices: Vec<String> = events.iter().map(|e| e.device_id.clone()).collect();
    devices.sort();
    devices.dedup();
    let total = events.len();
    Ok(Json(CorrelateResponse { events, devices, total }))
}

async fn handle_false_positive(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> ApiResult<FalsePositiveResponse> {
    state
        .engine
        .registry()
        .mark_false_positive(&event_id)
        .await
        .map_err(error_response)?;
    Ok(Json(FalsePositiveResponse {
        success: true,
        event_id,
    }))
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Thermoguard Server",
        "version": thermoguard_core::VERSION,
        "sensor": state.engine.sensor().name(),
        "endpoints": {
            "/": "This API index",
            "/health": "Liveness check",
            "/devices/{id}/health": "Health score, status and event counts for one device",
            "/threats": {
                "method": "GET",
                "description": "Active threats, most severe first",
                "params": { "severity": "low, medium, high or critical (default: medium and above)" },
            },
            "/statistics": "Per-component engine statistics",
            "/signatures": {
                "GET": "List known threat signatures",
                "POST": "Register a threat signature {threat_type, thermodynamic_fingerprint, severity, mitigation_strategy}",
            },
            "/correlate": {
                "method": "POST",
                "description": "Events similar to a pattern {pattern, window_minutes, similarity_threshold}",
            },
            "/events/{id}/false-positive": {
                "method": "POST",
                "description": "Exclude an event from correlation and active threats",
            },
        },
    }))
}

/// Build the axum router.
pub fn build_router(engine: Arc<SecurityEngine>) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/devices/{id}/health", get(handle_device_health))
        .route("/threats", get(handle_threats))
        .route("/statistics", get(handle_statistics))
        .route("/signatures", get(handle_list_signatures).post(handle_register_signature))
        .route("/correlate", post(handle_correlate))
        .route("/events/{id}/false-positive", post(handle_false_positive))
        .with_state(state)
}

/// Serve the query API until the listener fails.
pub async fn run_server(engine: Arc<SecurityEngine>, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(engine);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("query server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await
}
