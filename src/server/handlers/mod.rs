//! HTTP handlers for the server.

pub mod jobs;
pub mod printer;

use axum::{Json, http::StatusCode};
use serde_json::{Value, json};

use crate::error::FaroError;

pub type ApiError = (StatusCode, Json<Value>);

/// Map an error to its HTTP status.
fn status_for(err: &FaroError) -> StatusCode {
    match err {
        FaroError::QueueFull | FaroError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        FaroError::NoAddress => StatusCode::CONFLICT,
        FaroError::InvalidBitmap(_) | FaroError::Config(_) | FaroError::Image(_) => {
            StatusCode::BAD_REQUEST
        }
        FaroError::Transport(_) => StatusCode::BAD_GATEWAY,
        FaroError::Io(_) | FaroError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: FaroError) -> ApiError {
    (
        status_for(&err),
        Json(json!({"success": false, "error": err.to_string()})),
    )
}
