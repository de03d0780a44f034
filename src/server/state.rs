//! Server state and configuration.

use std::sync::Arc;

use crate::service::PrinterService;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080")
    pub listen_addr: String,
    /// Largest accepted print upload, in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<PrinterService>,
}

impl AppState {
    pub fn new(service: Arc<PrinterService>) -> Self {
        Self { service }
    }
}
