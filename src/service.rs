//! # Printer Service
//!
//! Wires the connection manager, the print dispatcher and the keep-alive
//! scheduler together and exposes the operations the web layer and other
//! producers call.
//!
//! ```no_run
//! use faro::service::{PrinterService, ServiceConfig};
//! use faro::transport::sim::SimPrinter;
//! use faro::Bitmap;
//!
//! # async fn example() -> Result<(), faro::FaroError> {
//! let sim = SimPrinter::new();
//! let service = PrinterService::start(sim.factory(), ServiceConfig::default()).await?;
//!
//! service.submit(Bitmap::test_pattern(384, 96))?;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bitmap::Bitmap;
use crate::config::{PrinterSettings, SharedSettings, Timings};
use crate::dispatch::{Activity, DEFAULT_QUEUE_CAPACITY, DispatchStats, Dispatcher, JobId, PrintQueue};
use crate::error::FaroError;
use crate::keepalive::{KeepAliveScheduler, MaintenanceCycle};
use crate::manager::ConnectionManager;
use crate::transport::{ClientFactory, ScanResult};

/// Height of the built-in test print, in dots.
const TEST_PRINT_HEIGHT: usize = 96;

/// Everything needed to start a [`PrinterService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub settings: PrinterSettings,
    pub timings: Timings,
    pub queue_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            settings: PrinterSettings::default(),
            timings: Timings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Result of an operator control, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReport {
    pub success: bool,
    /// Connection flag after the operation
    pub connected: bool,
    /// Raw error message when the operation failed
    pub error: Option<String>,
}

impl ControlReport {
    fn new<T>(result: &Result<T, FaroError>, connected: bool) -> Self {
        Self {
            success: result.is_ok(),
            connected,
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

/// Snapshot of the service for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterStatus {
    pub address: Option<String>,
    pub connected: bool,
    pub dry_run: bool,
    pub keep_alive_running: bool,
    pub keep_alive_interval_secs: Option<u64>,
    pub keep_alive_cycles: u64,
    pub queue_available: usize,
    pub jobs: DispatchStats,
}

/// The running printer subsystem.
pub struct PrinterService {
    manager: Arc<ConnectionManager>,
    keep_alive: KeepAliveScheduler,
    settings: SharedSettings,
    activity: Arc<Activity>,
    queue: RwLock<Option<PrintQueue>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    reconfigure: Mutex<()>,
}

impl PrinterService {
    /// Spawn the dispatcher and, when enabled, start keep-alive.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        factory: Arc<dyn ClientFactory>,
        config: ServiceConfig,
    ) -> Result<Self, FaroError> {
        let settings = config.settings.normalized();
        settings.validate()?;

        let manager = Arc::new(ConnectionManager::new(factory, config.timings));
        manager.set_address(settings.address.clone());
        let shared = SharedSettings::new(settings.clone());
        let activity = Arc::new(Activity::default());

        let (queue, rx) = PrintQueue::bounded(config.queue_capacity);
        let dispatcher = Dispatcher::new(manager.clone(), shared.clone(), activity.clone(), rx);
        let dispatcher = tokio::spawn(dispatcher.run());

        let keep_alive = KeepAliveScheduler::new(manager.clone());
        if settings.keep_alive_enabled {
            keep_alive.start(settings.keep_alive_interval()).await;
        }

        info!(
            address = settings.address.as_deref().unwrap_or("-"),
            dry_run = settings.dry_run,
            keep_alive = settings.keep_alive_enabled,
            "Printer service started"
        );

        Ok(Self {
            manager,
            keep_alive,
            settings: shared,
            activity,
            queue: RwLock::new(Some(queue)),
            dispatcher: Mutex::new(Some(dispatcher)),
            reconfigure: Mutex::new(()),
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn settings(&self) -> PrinterSettings {
        self.settings.snapshot()
    }

    /// Queue a bitmap. Never waits; a full queue is an immediate error.
    pub fn submit(&self, bitmap: Bitmap) -> Result<JobId, FaroError> {
        let queue = self
            .queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(FaroError::QueueClosed)?;
        queue.submit(bitmap)
    }

    /// Queue the built-in test pattern at the configured paper width.
    pub fn test_print(&self) -> Result<JobId, FaroError> {
        let width = self.settings.snapshot().paper_width;
        self.submit(Bitmap::test_pattern(width, TEST_PRINT_HEIGHT))
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Reconnect to `address`, or to the configured printer when `None`.
    ///
    /// A new address is stored in the settings and restarts keep-alive.
    pub async fn reconnect(&self, address: Option<String>) -> ControlReport {
        let result = self.reconnect_inner(address).await;
        ControlReport::new(&result, self.manager.is_connected())
    }

    async fn reconnect_inner(&self, address: Option<String>) -> Result<(), FaroError> {
        let _reconfigure = self.reconfigure.lock().await;

        let mut changed = None;
        if let Some(address) = address {
            let mut settings = self.settings.snapshot();
            settings.address = Some(address);
            let settings = settings.normalized();
            settings.validate()?;
            if settings.address != self.manager.address() {
                changed = Some(settings);
            }
        }

        if let Some(settings) = &changed {
            self.keep_alive.stop().await;
            self.manager.disconnect().await;
            self.manager.set_address(settings.address.clone());
            self.settings.replace(settings.clone());
        }

        let address = self.manager.address().ok_or(FaroError::NoAddress)?;
        info!(address = %address, "Manual reconnect");
        let result = {
            let mut session = self.manager.session().await;
            session.disconnect().await;
            match session.setup().await {
                Ok(_) => session.connect(&address).await.map(|_| ()),
                Err(e) => Err(e),
            }
        };

        // The reconnect already did the work of an immediate cycle.
        if let Some(settings) = changed {
            if settings.keep_alive_enabled {
                self.keep_alive.schedule(settings.keep_alive_interval()).await;
            }
        }
        result
    }

    /// Check that a printer at `address` accepts a connection, then
    /// disconnect again. The configured address is left untouched.
    pub async fn test_connect(&self, address: &str) -> ControlReport {
        let result = self.test_connect_inner(address).await;
        ControlReport::new(&result, self.manager.is_connected())
    }

    async fn test_connect_inner(&self, address: &str) -> Result<(), FaroError> {
        let candidate = PrinterSettings {
            address: Some(address.to_string()),
            ..Default::default()
        }
        .normalized();
        candidate.validate()?;
        let address = candidate.address.ok_or(FaroError::NoAddress)?;

        info!(address = %address, "Test connect");
        let mut session = self.manager.session().await;
        session.disconnect().await;
        session.setup().await?;
        let result = session.connect(&address).await.map(|_| ());
        session.disconnect().await;
        result
    }

    /// Discover printers whose name contains `name_filter`.
    pub async fn scan(&self, name_filter: &str, timeout: Duration) -> Result<ScanResult, FaroError> {
        info!(name_filter, timeout_secs = timeout.as_secs(), "Scanning for printers");
        let found = self
            .manager
            .session()
            .await
            .scan(name_filter, timeout)
            .await?;
        info!(count = found.len(), "Scan complete");
        Ok(found)
    }

    /// Start (or restart) keep-alive with the configured interval.
    pub async fn start_keep_alive(&self) -> MaintenanceCycle {
        let interval = self.settings.snapshot().keep_alive_interval();
        self.keep_alive.start(interval).await
    }

    pub async fn stop_keep_alive(&self) {
        self.keep_alive.stop().await;
    }

    /// Replace the settings.
    ///
    /// Address and keep-alive changes stop the scheduler, apply the change
    /// and start it again when enabled. A dry-run change alone applies
    /// immediately.
    pub async fn apply_settings(&self, settings: PrinterSettings) -> Result<(), FaroError> {
        let settings = settings.normalized();
        settings.validate()?;
        let _reconfigure = self.reconfigure.lock().await;

        let previous = self.settings.snapshot();
        if !previous.needs_keep_alive_restart(&settings) {
            self.settings.replace(settings);
            return Ok(());
        }

        self.keep_alive.stop().await;
        if previous.address != settings.address {
            info!(
                from = previous.address.as_deref().unwrap_or("-"),
                to = settings.address.as_deref().unwrap_or("-"),
                "Printer address changed"
            );
            self.manager.disconnect().await;
            self.manager.set_address(settings.address.clone());
        }
        self.settings.replace(settings.clone());

        if settings.keep_alive_enabled {
            self.keep_alive.start(settings.keep_alive_interval()).await;
        }
        Ok(())
    }

    pub async fn status(&self) -> PrinterStatus {
        let settings = self.settings.snapshot();
        let state = self.manager.state();
        let queue_available = self
            .queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, PrintQueue::available);
        let interval = self.keep_alive.interval();

        PrinterStatus {
            address: state.address,
            connected: state.connected,
            dry_run: settings.dry_run,
            keep_alive_running: interval.is_some(),
            keep_alive_interval_secs: interval.map(|i| i.as_secs()),
            keep_alive_cycles: self.keep_alive.cycles(),
            queue_available,
            jobs: self.activity.stats(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.activity.stats()
    }

    /// Stop accepting jobs, let queued jobs finish, stop keep-alive and
    /// release the device.
    pub async fn shutdown(&self) {
        info!("Printer service shutting down");
        self.queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "Dispatcher ended abnormally");
            }
        }

        self.keep_alive.stop().await;
        self.manager.stop().await;
        info!("Printer service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimPrinter;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn config(address: Option<&str>, keep_alive: bool) -> ServiceConfig {
        ServiceConfig {
            settings: PrinterSettings {
                address: address.map(str::to_string),
                keep_alive_enabled: keep_alive,
                ..Default::default()
            },
            timings: Timings::immediate(),
            queue_capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_start_runs_first_keep_alive_cycle() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), true))
            .await
            .unwrap();

        assert!(service.is_connected());
        let status = service.status().await;
        assert!(status.keep_alive_running);
        assert_eq!(status.keep_alive_cycles, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_address() {
        let sim = SimPrinter::new();
        let result = PrinterService::start(sim.factory(), config(Some("printer"), false)).await;
        assert!(matches!(result, Err(FaroError::Config(_))));
    }

    #[tokio::test]
    async fn test_reconnect_without_address() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(None, false))
            .await
            .unwrap();

        let report = service.reconnect(None).await;
        assert!(!report.success);
        assert!(!report.connected);
        assert_eq!(report.error.as_deref(), Some("No printer address configured"));
    }

    #[tokio::test]
    async fn test_reconnect_to_new_address_stores_it() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(None, true))
            .await
            .unwrap();

        let report = service.reconnect(Some("aa:bb:cc:dd:ee:01".to_string())).await;
        assert!(report.success);
        assert!(report.connected);
        assert_eq!(
            service.settings().address.as_deref(),
            Some("AA:BB:CC:DD:EE:01")
        );
        assert!(service.status().await.keep_alive_running);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_test_connect_leaves_printer_disconnected() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), false))
            .await
            .unwrap();

        let report = service.test_connect("AA:BB:CC:DD:EE:02").await;
        assert_eq!(
            report,
            ControlReport {
                success: true,
                connected: false,
                error: None
            }
        );
        assert_eq!(service.settings().address.as_deref(), Some(ADDR));
        assert_eq!(sim.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_dry_run_change_does_not_restart_keep_alive() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), true))
            .await
            .unwrap();

        let mut settings = service.settings();
        settings.dry_run = true;
        service.apply_settings(settings).await.unwrap();

        assert!(service.status().await.dry_run);
        assert_eq!(service.status().await.keep_alive_cycles, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_interval_change_restarts_keep_alive() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), true))
            .await
            .unwrap();

        let mut settings = service.settings();
        settings.keep_alive_interval_secs = 300;
        service.apply_settings(settings).await.unwrap();

        let status = service.status().await;
        assert_eq!(status.keep_alive_interval_secs, Some(300));
        assert_eq!(status.keep_alive_cycles, 2);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_answers_during_keep_alive_restart() {
        let sim = SimPrinter::new();
        let service = Arc::new(
            PrinterService::start(sim.factory(), config(Some(ADDR), true))
                .await
                .unwrap(),
        );
        sim.set_latency(Duration::from_millis(300));

        let restarting = service.clone();
        let restart = tokio::spawn(async move {
            let mut settings = restarting.settings();
            settings.keep_alive_interval_secs = 300;
            restarting.apply_settings(settings).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tokio::time::timeout(Duration::from_millis(100), service.status())
            .await
            .expect("status waited on the restart");
        assert_eq!(status.keep_alive_interval_secs, Some(300));

        restart.await.unwrap().unwrap();
        sim.set_latency(Duration::ZERO);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_paper_width_is_rejected() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), false))
            .await
            .unwrap();

        let mut settings = service.settings();
        settings.paper_width = usize::MAX;
        let result = service.apply_settings(settings).await;
        assert!(matches!(result, Err(FaroError::Config(_))));

        assert_eq!(service.settings().paper_width, crate::config::DEFAULT_PAPER_WIDTH);
        assert!(service.test_print().is_ok());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabling_keep_alive_stops_it() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), true))
            .await
            .unwrap();

        let mut settings = service.settings();
        settings.keep_alive_enabled = false;
        service.apply_settings(settings).await.unwrap();

        assert!(!service.status().await.keep_alive_running);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let sim = SimPrinter::new();
        let service = PrinterService::start(sim.factory(), config(Some(ADDR), false))
            .await
            .unwrap();
        service.shutdown().await;

        assert!(matches!(
            service.submit(Bitmap::test_pattern(8, 8)),
            Err(FaroError::QueueClosed)
        ));
        assert_eq!(sim.stats().releases, 1);
    }
}
