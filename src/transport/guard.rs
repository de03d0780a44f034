//! Panic-guarded client adapter.
//!
//! Device libraries that sit close to the hardware may panic on device
//! states they do not expect. [`GuardedClient`] is the single place where
//! such panics are caught; everything above it sees a plain
//! [`TransportError`].

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, warn};

use super::{DeviceClient, PrintOptions, ScanResult, TransportError};
use crate::bitmap::Bitmap;

/// Prefix of errors produced from a caught panic.
pub const PANIC_PREFIX: &str = "transport panicked";

/// A [`DeviceClient`] whose calls never unwind into the caller.
pub struct GuardedClient {
    inner: Box<dyn DeviceClient>,
}

impl GuardedClient {
    pub fn new(inner: Box<dyn DeviceClient>) -> Self {
        Self { inner }
    }

    pub async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        flatten(AssertUnwindSafe(self.inner.connect(address)).catch_unwind().await)
    }

    /// Best-effort: failures and panics are logged and swallowed.
    pub async fn disconnect(&mut self) {
        let result = flatten(AssertUnwindSafe(self.inner.disconnect()).catch_unwind().await);
        match result {
            Ok(()) => debug!("Device session closed"),
            Err(e) => warn!(error = %e, "Disconnect failed (ignored)"),
        }
    }

    /// Best-effort: failures and panics are logged and swallowed.
    pub async fn release(&mut self) {
        let result = flatten(AssertUnwindSafe(self.inner.release()).catch_unwind().await);
        if let Err(e) = result {
            warn!(error = %e, "Release failed (ignored)");
        }
    }

    pub async fn print(
        &mut self,
        bitmap: &Bitmap,
        options: &PrintOptions,
    ) -> Result<(), TransportError> {
        flatten(
            AssertUnwindSafe(self.inner.print(bitmap, options))
                .catch_unwind()
                .await,
        )
    }

    pub async fn scan(&mut self, name_filter: &str) -> Result<ScanResult, TransportError> {
        flatten(AssertUnwindSafe(self.inner.scan(name_filter)).catch_unwind().await)
    }
}

fn flatten<T>(
    result: Result<Result<T, TransportError>, Box<dyn Any + Send>>,
) -> Result<T, TransportError> {
    match result {
        Ok(inner) => inner,
        Err(payload) => Err(TransportError::new(format!(
            "{}: {}",
            PANIC_PREFIX,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
