//! # Configuration
//!
//! Operator-facing printer settings ([`PrinterSettings`]) and the internal
//! settle delays used by the connection manager ([`Timings`]).
//!
//! Settings are read from a JSON file; missing fields take their defaults.
//!
//! ```
//! use faro::config::PrinterSettings;
//!
//! let settings: PrinterSettings =
//!     serde_json::from_str(r#"{"address": "AA:BB:CC:DD:EE:FF", "dry_run": true}"#).unwrap();
//! assert!(settings.keep_alive_enabled);
//! assert_eq!(settings.keep_alive_interval().as_secs(), 60);
//! ```

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FaroError;
use crate::transport::{PrintOptions, is_valid_mac};

/// Keep-alive interval used when the configured value is missing or zero.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Print width of the common 58mm BLE cat printers, in dots.
pub const DEFAULT_PAPER_WIDTH: usize = 384;

/// Widest raster the settings accept, in dots.
pub const MAX_PAPER_WIDTH: usize = 4096;

fn default_true() -> bool {
    true
}

fn default_paper_width() -> usize {
    DEFAULT_PAPER_WIDTH
}

/// Printer settings as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterSettings {
    /// Bluetooth address of the printer
    pub address: Option<String>,
    /// Run the keep-alive scheduler
    #[serde(default = "default_true")]
    pub keep_alive_enabled: bool,
    /// Seconds between keep-alive cycles (0 means default)
    pub keep_alive_interval_secs: u64,
    /// Accept and track jobs without sending them to the device
    pub dry_run: bool,
    /// Forwarded to the device with each print
    pub print_options: PrintOptions,
    /// Paper width in dots, used for the built-in test print
    #[serde(default = "default_paper_width")]
    pub paper_width: usize,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            address: None,
            keep_alive_enabled: true,
            keep_alive_interval_secs: DEFAULT_KEEP_ALIVE_SECS,
            dry_run: false,
            print_options: PrintOptions::default(),
            paper_width: DEFAULT_PAPER_WIDTH,
        }
    }
}

impl PrinterSettings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FaroError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings: Self = serde_json::from_str(&text)?;
        Ok(settings.normalized())
    }

    /// Effective keep-alive interval (zero falls back to the default).
    pub fn keep_alive_interval(&self) -> Duration {
        match self.keep_alive_interval_secs {
            0 => Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Trim the address and treat an empty one as unset.
    pub fn normalized(mut self) -> Self {
        self.address = self
            .address
            .map(|a| a.trim().to_uppercase())
            .filter(|a| !a.is_empty());
        self
    }

    /// Reject addresses that are not `XX:XX:XX:XX:XX:XX`.
    pub fn validate(&self) -> Result<(), FaroError> {
        if let Some(address) = &self.address {
            if !is_valid_mac(address) {
                return Err(FaroError::Config(format!(
                    "invalid printer address '{}'",
                    address
                )));
            }
        }
        if !(1..=MAX_PAPER_WIDTH).contains(&self.paper_width) {
            return Err(FaroError::Config(format!(
                "paper width {} outside 1..={} dots",
                self.paper_width, MAX_PAPER_WIDTH
            )));
        }
        Ok(())
    }

    /// Whether moving from `self` to `other` requires restarting keep-alive.
    pub fn needs_keep_alive_restart(&self, other: &PrinterSettings) -> bool {
        self.address != other.address
            || self.keep_alive_enabled != other.keep_alive_enabled
            || self.keep_alive_interval() != other.keep_alive_interval()
    }
}

/// Settings shared between the service, the dispatcher and the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<PrinterSettings>>);

impl SharedSettings {
    pub fn new(settings: PrinterSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> PrinterSettings {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the settings, returning the previous value.
    pub fn replace(&self, settings: PrinterSettings) -> PrinterSettings {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, settings)
    }
}

/// Delays around device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// After soft-disconnecting a reused handle in setup
    pub setup_settle: Duration,
    /// After the refresh disconnect at the start of a keep-alive cycle
    pub refresh_settle: Duration,
    /// After releasing a handle, before allocating a new one
    pub release_settle: Duration,
    /// Upper bound on a device scan
    pub scan_timeout: Duration,
    /// How long stopping keep-alive waits for the running cycle
    pub stop_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            setup_settle: Duration::from_secs(1),
            refresh_settle: Duration::from_millis(500),
            release_settle: Duration::from_secs(1),
            scan_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(15),
        }
    }
}

impl Timings {
    /// No settle delays (tests and simulation).
    pub fn immediate() -> Self {
        Self {
            setup_settle: Duration::ZERO,
            refresh_settle: Duration::ZERO,
            release_settle: Duration::ZERO,
            scan_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_defaults() {
        let mut settings = PrinterSettings::default();
        assert_eq!(settings.keep_alive_interval(), Duration::from_secs(60));

        settings.keep_alive_interval_secs = 0;
        assert_eq!(settings.keep_alive_interval(), Duration::from_secs(60));

        settings.keep_alive_interval_secs = 15;
        assert_eq!(settings.keep_alive_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: PrinterSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, PrinterSettings::default());
    }

    #[test]
    fn test_normalized_address() {
        let settings = PrinterSettings {
            address: Some("  aa:bb:cc:dd:ee:ff ".to_string()),
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));

        let empty = PrinterSettings {
            address: Some("   ".to_string()),
            ..Default::default()
        }
        .normalized();
        assert_eq!(empty.address, None);
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let settings = PrinterSettings {
            address: Some("printer".to_string()),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(FaroError::Config(_))));
        assert!(PrinterSettings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_paper_width() {
        for paper_width in [0, MAX_PAPER_WIDTH + 1, usize::MAX] {
            let settings = PrinterSettings {
                paper_width,
                ..Default::default()
            };
            assert!(matches!(settings.validate(), Err(FaroError::Config(_))));
        }
        let widest = PrinterSettings {
            paper_width: MAX_PAPER_WIDTH,
            ..Default::default()
        };
        assert!(widest.validate().is_ok());
    }

    #[test]
    fn test_restart_detection() {
        let before = PrinterSettings::default();

        let dry = PrinterSettings {
            dry_run: true,
            ..before.clone()
        };
        assert!(!before.needs_keep_alive_restart(&dry));

        let moved = PrinterSettings {
            address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ..before.clone()
        };
        assert!(before.needs_keep_alive_restart(&moved));

        let slower = PrinterSettings {
            keep_alive_interval_secs: 120,
            ..before.clone()
        };
        assert!(before.needs_keep_alive_restart(&slower));
    }

    #[test]
    fn test_shared_settings_replace() {
        let shared = SharedSettings::new(PrinterSettings::default());
        let previous = shared.replace(PrinterSettings {
            dry_run: true,
            ..Default::default()
        });
        assert!(!previous.dry_run);
        assert!(shared.snapshot().dry_run);
    }
}
