//! Print job API handlers.

use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::{bitmap::Bitmap, dispatch::DispatchStats, error::FaroError};

use super::super::state::AppState;
use super::{ApiError, error_response};

/// POST /api/print - Queue a PNG for printing.
///
/// Returns 202 with the job id, or 503 when the queue is full.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.is_empty() {
        return Err(error_response(FaroError::Image(
            "empty request body".to_string(),
        )));
    }

    // Decoding is CPU bound
    let bitmap = tokio::task::spawn_blocking(move || Bitmap::decode(&body))
        .await
        .map_err(|e| error_response(FaroError::Image(format!("decode task failed: {}", e))))?
        .map_err(error_response)?;

    info!(
        width = bitmap.width(),
        height = bitmap.height(),
        "Print job received"
    );
    let id = state.service.submit(bitmap).map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "job_id": id})),
    ))
}

/// GET /api/print/stats - Delivery counters.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<DispatchStats> {
    Json(state.service.stats())
}
