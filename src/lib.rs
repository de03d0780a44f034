//! # Faro - Shared Bluetooth LE Thermal Printer Manager
//!
//! Faro keeps one BLE thermal printer usable by several producers at once.
//! It provides:
//!
//! - **Connection management**: one device handle, guarded by an
//!   exclusivity lock, with fault-aware recovery
//! - **Keep-alive**: periodic refresh cycles so the printer never idles out
//! - **Print dispatch**: a bounded queue drained by a single worker with
//!   at-most-once delivery and a dry-run mode
//! - **Transport**: a `btleplug` backend and a scripted simulator
//!
//! ## Quick Start
//!
//! ```no_run
//! use faro::{
//!     Bitmap, PrinterSettings,
//!     service::{PrinterService, ServiceConfig},
//!     transport::sim::SimPrinter,
//! };
//!
//! # async fn example() -> Result<(), faro::FaroError> {
//! let sim = SimPrinter::new();
//! let config = ServiceConfig {
//!     settings: PrinterSettings {
//!         address: Some("AA:BB:CC:DD:EE:FF".to_string()),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//!
//! let service = PrinterService::start(sim.factory(), config).await?;
//! service.submit(Bitmap::test_pattern(384, 96))?;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`manager`] | Device handle ownership, setup, connect, recreate |
//! | [`keepalive`] | Maintenance cycle and its scheduler |
//! | [`dispatch`] | Print queue and the dispatcher worker |
//! | [`fault`] | Classification of transport error messages |
//! | [`service`] | Wiring and operator controls |
//! | [`server`] | HTTP API |
//! | [`transport`] | Device client boundary and backends |
//! | [`config`] | Settings and timings |
//! | [`bitmap`] | 1-bit print images |
//! | [`error`] | Error types |
//!
//! ## Lock Order
//!
//! Keep-alive control is always taken before the device lock. The status
//! lock is never held across an await.

pub mod bitmap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod keepalive;
pub mod manager;
pub mod server;
pub mod service;
pub mod transport;

// Re-exports for convenience
pub use bitmap::Bitmap;
pub use config::{PrinterSettings, Timings};
pub use error::FaroError;
pub use manager::ConnectionManager;
pub use service::PrinterService;
