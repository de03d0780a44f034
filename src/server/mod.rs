//! # HTTP Server for Printer Control
//!
//! A thin JSON layer over [`PrinterService`]: status, operator controls,
//! settings and print submission.
//!
//! ## Usage
//!
//! ```bash
//! faro serve --listen 0.0.0.0:8080 --address AA:BB:CC:DD:EE:FF
//! ```
//!
//! ## Routes
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/printer/status` | Connection, keep-alive and queue status |
//! | POST | `/api/printer/reconnect` | Reconnect, optionally to a new address |
//! | POST | `/api/printer/test-connect` | Connect to an address, then disconnect |
//! | POST | `/api/printer/test-print` | Queue the test pattern |
//! | GET | `/api/printer/scan` | Discover printers (`name`, `timeout_secs`) |
//! | POST | `/api/printer/keep-alive/start` | Start keep-alive |
//! | POST | `/api/printer/keep-alive/stop` | Stop keep-alive |
//! | GET/PUT | `/api/printer/settings` | Read or replace settings |
//! | POST | `/api/print` | Queue a PNG (503 when the queue is full) |
//! | GET | `/api/print/stats` | Delivery counters |

mod handlers;
mod state;

pub use state::{AppState, ServerConfig};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::FaroError;
use crate::service::PrinterService;

/// Build the API router.
pub fn router(service: Arc<PrinterService>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState::new(service));

    Router::new()
        // Printer controls
        .route("/api/printer/status", get(handlers::printer::status))
        .route("/api/printer/reconnect", post(handlers::printer::reconnect))
        .route(
            "/api/printer/test-connect",
            post(handlers::printer::test_connect),
        )
        .route("/api/printer/test-print", post(handlers::printer::test_print))
        .route("/api/printer/scan", get(handlers::printer::scan))
        .route(
            "/api/printer/keep-alive/start",
            post(handlers::printer::keep_alive_start),
        )
        .route(
            "/api/printer/keep-alive/stop",
            post(handlers::printer::keep_alive_stop),
        )
        .route(
            "/api/printer/settings",
            get(handlers::printer::get_settings).put(handlers::printer::put_settings),
        )
        // Print jobs
        .route(
            "/api/print",
            post(handlers::jobs::submit).layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        )
        .route("/api/print/stats", get(handlers::jobs::stats))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Start the HTTP server and run until Ctrl-C.
///
/// On shutdown the service drains its queue and releases the printer.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use faro::server::{serve, ServerConfig};
/// use faro::service::{PrinterService, ServiceConfig};
/// use faro::transport::sim::SimPrinter;
///
/// # async fn example() -> Result<(), faro::FaroError> {
/// let sim = SimPrinter::new();
/// let service = PrinterService::start(sim.factory(), ServiceConfig::default()).await?;
/// serve(ServerConfig::default(), Arc::new(service)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn serve(config: ServerConfig, service: Arc<PrinterService>) -> Result<(), FaroError> {
    let app = router(service.clone(), &config);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| {
            FaroError::Config(format!("Failed to bind to {}: {}", config.listen_addr, e))
        })?;

    info!(listen = %config.listen_addr, "HTTP server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    service.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
