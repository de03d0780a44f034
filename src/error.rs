//! # Error Types
//!
//! This module defines error types used throughout the faro library.

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for faro operations
#[derive(Debug, Error)]
pub enum FaroError {
    /// Transport-level errors (connect, print, scan). The message is the raw
    /// text reported by the device library.
    #[error("{0}")]
    Transport(String),

    /// The print queue is at capacity
    #[error("Print queue is full")]
    QueueFull,

    /// The print queue no longer accepts jobs (service shutting down)
    #[error("Print queue is closed")]
    QueueClosed,

    /// No printer address is configured
    #[error("No printer address configured")]
    NoAddress,

    /// Bitmap dimensions or data are inconsistent
    #[error("Invalid bitmap: {0}")]
    InvalidBitmap(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TransportError> for FaroError {
    fn from(err: TransportError) -> Self {
        FaroError::Transport(err.message().to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, FaroError>;
