//! # Printer Transport Layer
//!
//! This module defines the boundary to the device-control library that
//! actually talks to the printer over Bluetooth LE.
//!
//! The core never calls a concrete backend directly. It holds a
//! [`ClientFactory`] ("new client") and the [`DeviceClient`] handles it
//! produces, always wrapped in a [`GuardedClient`] so that a panic inside
//! hardware-adjacent code degrades to a [`TransportError`].
//!
//! ## Available Transports
//!
//! - [`sim`]: scripted in-process printer for tests and `--simulate`
//! - `btle`: `btleplug` backend (enable the `ble` feature)
//!
//! ## Errors
//!
//! The device library reports plain strings. [`TransportError`] keeps the raw
//! message so that [`crate::fault`] can classify it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitmap::Bitmap;

#[cfg(feature = "ble")]
pub mod btle;
pub mod guard;
pub mod sim;

pub use guard::GuardedClient;

/// Raw error reported by the device library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The message exactly as the device library reported it.
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Options forwarded to the device with each print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintOptions {
    /// Rotate landscape bitmaps to fit the paper width
    pub auto_rotate: bool,
    /// Blank lines fed after the image
    pub feed_lines: u8,
    /// Print head energy (darkness), device specific scale
    pub energy: u8,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            auto_rotate: false,
            feed_lines: 4,
            energy: 0x60,
        }
    }
}

/// Addresses of discovered printers mapped to their advertised names.
pub type ScanResult = BTreeMap<String, String>;

/// A client bound to one BLE printer device.
///
/// Allocating a client and releasing it are expensive (adapter setup,
/// device discovery), so the connection manager reuses one client across
/// many connect/disconnect cycles.
#[async_trait]
pub trait DeviceClient: Send {
    /// Open a session with the printer at `address`.
    async fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    /// End the session but keep the client allocated.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Free the underlying device allocation. The client is not used again.
    async fn release(&mut self) -> Result<(), TransportError>;

    /// Send one finished bitmap.
    async fn print(&mut self, bitmap: &Bitmap, options: &PrintOptions)
    -> Result<(), TransportError>;

    /// Discover printers whose advertised name contains `name_filter`.
    async fn scan(&mut self, name_filter: &str) -> Result<ScanResult, TransportError>;
}

/// Allocates fresh [`DeviceClient`] instances.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn new_client(&self) -> Result<Box<dyn DeviceClient>, TransportError>;
}

/// Validate a Bluetooth MAC address format (XX:XX:XX:XX:XX:XX).
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }
    parts
        .iter()
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_mac_addresses() {
        assert!(is_valid_mac("00:11:22:33:44:55"));
        assert!(is_valid_mac("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_invalid_mac_addresses() {
        assert!(!is_valid_mac("00:11:22:33:44")); // too short
        assert!(!is_valid_mac("00:11:22:33:44:55:66")); // too long
        assert!(!is_valid_mac("00-11-22-33-44-55")); // wrong separator
        assert!(!is_valid_mac("GG:HH:II:JJ:KK:LL")); // invalid hex
        assert!(!is_valid_mac(""));
    }

    #[test]
    fn test_transport_error_keeps_raw_message() {
        let err = TransportError::new("le-connection-abort-by-local");
        assert_eq!(err.message(), "le-connection-abort-by-local");
        assert_eq!(err.to_string(), "le-connection-abort-by-local");
    }
}
