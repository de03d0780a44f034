//! Printer control API handlers.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};

use crate::{
    config::PrinterSettings,
    keepalive::MaintenanceCycle,
    service::{ControlReport, PrinterStatus},
    transport::ScanResult,
};

use super::super::state::AppState;
use super::{ApiError, error_response};

/// Default printer name filter for scans.
const DEFAULT_SCAN_FILTER: &str = "";

/// Shortest scan a client may ask for.
const MIN_SCAN_TIMEOUT_SECS: u64 = 1;

/// Body for reconnect. Omit `address` to reconnect to the configured printer.
#[derive(Debug, Deserialize)]
pub struct ReconnectRequest {
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestConnectRequest {
    pub address: String,
}

/// Query parameters for scan endpoint.
#[derive(Debug, Deserialize)]
pub struct ScanQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn control(report: ControlReport) -> (StatusCode, Json<ControlReport>) {
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(report))
}

/// GET /api/printer/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<PrinterStatus> {
    Json(state.service.status().await)
}

/// POST /api/printer/reconnect
pub async fn reconnect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ReconnectRequest>>,
) -> (StatusCode, Json<ControlReport>) {
    let address = body.and_then(|Json(req)| req.address);
    control(state.service.reconnect(address).await)
}

/// POST /api/printer/test-connect
pub async fn test_connect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestConnectRequest>,
) -> (StatusCode, Json<ControlReport>) {
    control(state.service.test_connect(&req.address).await)
}

/// POST /api/printer/test-print
pub async fn test_print(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = state.service.test_print().map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "job_id": id})),
    ))
}

/// GET /api/printer/scan?name=&timeout_secs=
pub async fn scan(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanQuery>,
) -> Result<Json<ScanResult>, ApiError> {
    let filter = query.name.as_deref().unwrap_or(DEFAULT_SCAN_FILTER);
    let timeout = query
        .timeout_secs
        .map(|secs| Duration::from_secs(secs.max(MIN_SCAN_TIMEOUT_SECS)))
        .unwrap_or(state.service.manager().timings().scan_timeout);
    state
        .service
        .scan(filter, timeout)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /api/printer/keep-alive/start
pub async fn keep_alive_start(State(state): State<Arc<AppState>>) -> Json<MaintenanceCycle> {
    Json(state.service.start_keep_alive().await)
}

/// POST /api/printer/keep-alive/stop
pub async fn keep_alive_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.service.stop_keep_alive().await;
    Json(json!({"success": true}))
}

/// GET /api/printer/settings
pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<PrinterSettings> {
    Json(state.service.settings())
}

/// PUT /api/printer/settings
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<PrinterSettings>,
) -> Result<Json<PrinterSettings>, ApiError> {
    state
        .service
        .apply_settings(settings)
        .await
        .map_err(error_response)?;
    Ok(Json(state.service.settings()))
}
