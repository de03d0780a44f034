//! # Connection Manager
//!
//! Owns the single device handle and the `connected` flag, and is the only
//! code that drives the transport.
//!
//! ## Locks
//!
//! - **Exclusivity lock**: a tokio mutex that *contains* the optional
//!   [`DeviceHandle`]. Every handle-touching operation is a method on
//!   [`Session`], and a session can only be obtained by taking this lock, so
//!   the dispatcher, the keep-alive scheduler and operator controls cannot
//!   interleave calls on the same BLE session.
//! - **Status lock**: a short-lived `RwLock` over [`ConnectionState`]. It is
//!   never held across an `.await`.
//!
//! ## Recovery Levels
//!
//! 1. The session dropped but the handle is fine: reconnect with the same
//!    handle (cheap).
//! 2. The handle itself is broken: release it, allocate a new one and retry
//!    once (slow, only on a known fault signature, see [`crate::fault`]).
//!
//! `connect` performs level 2 itself for handle-fatal faults; the keep-alive
//! cycle additionally escalates on transport-stack faults.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::config::Timings;
use crate::error::FaroError;
use crate::fault::{FaultKind, classify};
use crate::transport::{ClientFactory, GuardedClient, PrintOptions, ScanResult, TransportError};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an allocated device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An allocated device client.
pub struct DeviceHandle {
    id: HandleId,
    client: GuardedClient,
}

impl DeviceHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

/// What the manager believes about the printer connection.
///
/// `connected` is a belief, not a guarantee: callers still attempt the
/// operation and reset the flag when it fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub address: Option<String>,
    pub connected: bool,
}

/// Owner of the printer's device handle.
pub struct ConnectionManager {
    factory: Arc<dyn ClientFactory>,
    timings: Timings,
    device: Mutex<Option<DeviceHandle>>,
    state: RwLock<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ClientFactory>, timings: Timings) -> Self {
        Self {
            factory,
            timings,
            device: Mutex::new(None),
            state: RwLock::new(ConnectionState::default()),
        }
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Take the exclusivity lock.
    ///
    /// Waits while another task holds a session; BLE connects can take
    /// several seconds.
    pub async fn session(&self) -> Session<'_> {
        Session {
            manager: self,
            device: self.device.lock().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connected
    }

    /// Force callers back onto the "must reconnect" path without tearing
    /// down the handle.
    pub fn reset_connection_status(&self) {
        self.set_connected(false);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn address(&self) -> Option<String> {
        self.state().address
    }

    pub fn set_address(&self, address: Option<String>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .address = address;
    }

    fn set_connected(&self, connected: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connected = connected;
    }

    /// Setup followed by connect, under one session.
    pub async fn connect_to(&self, address: &str) -> Result<HandleId, FaroError> {
        let mut session = self.session().await;
        session.setup().await?;
        session.connect(address).await
    }

    /// Soft teardown under the exclusivity lock.
    pub async fn disconnect(&self) {
        self.session().await.disconnect().await;
    }

    /// Hard teardown under the exclusivity lock.
    pub async fn stop(&self) {
        self.session().await.stop().await;
    }
}

/// Exclusive access to the device handle.
///
/// Dropping the session releases the exclusivity lock.
pub struct Session<'a> {
    manager: &'a ConnectionManager,
    device: MutexGuard<'a, Option<DeviceHandle>>,
}

impl<'a> Session<'a> {
    pub fn manager(&self) -> &'a ConnectionManager {
        self.manager
    }

    /// Identity of the current handle, if one is allocated.
    pub fn handle_id(&self) -> Option<HandleId> {
        self.device.as_ref().map(DeviceHandle::id)
    }

    /// Prepare a handle for a fresh connect.
    ///
    /// An existing handle is reused. If it is believed connected it is
    /// soft-disconnected first and the transport is given time to settle.
    pub async fn setup(&mut self) -> Result<HandleId, FaroError> {
        let manager = self.manager;
        let Some(handle) = self.device.as_mut() else {
            return self.allocate().await;
        };

        if manager.is_connected() {
            debug!(handle = %handle.id, "Reusing connected handle, disconnecting first");
            handle.client.disconnect().await;
            manager.set_connected(false);
            sleep(manager.timings.setup_settle).await;
        } else {
            debug!(handle = %handle.id, "Reusing handle");
        }
        Ok(handle.id)
    }

    /// Allocate a handle if none exists, without touching an existing one.
    pub async fn ensure_handle(&mut self) -> Result<HandleId, FaroError> {
        match self.handle_id() {
            Some(id) => Ok(id),
            None => self.allocate().await,
        }
    }

    /// Connect the current handle to `address`.
    ///
    /// "Already connected" counts as success. A handle-fatal fault swaps the
    /// handle for a new one and retries exactly once; any other error is
    /// returned unmodified with the status left disconnected.
    pub async fn connect(&mut self, address: &str) -> Result<HandleId, FaroError> {
        self.ensure_handle().await?;

        match self.try_connect(address).await {
            Ok(id) => Ok(id),
            Err(e) if classify(&e).recreates_handle_on_connect() => {
                warn!(address, error = %e, "Handle unusable, recreating and retrying once");
                self.recreate().await?;
                Ok(self.try_connect(address).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One connect attempt on the current handle, never recreating it.
    ///
    /// "Already connected" counts as success. Callers that run their own
    /// recovery use this so a failure costs at most one handle reset.
    pub async fn connect_once(&mut self, address: &str) -> Result<HandleId, FaroError> {
        self.ensure_handle().await?;
        Ok(self.try_connect(address).await?)
    }

    async fn try_connect(&mut self, address: &str) -> Result<HandleId, TransportError> {
        let manager = self.manager;
        let handle = self
            .device
            .as_mut()
            .ok_or_else(|| TransportError::new("no device handle"))?;

        match handle.client.connect(address).await {
            Ok(()) => {
                info!(address, handle = %handle.id, "Printer connected");
                manager.set_connected(true);
                Ok(handle.id)
            }
            Err(e) if classify(&e) == FaultKind::AlreadyConnected => {
                debug!(address, handle = %handle.id, "Printer already connected");
                manager.set_connected(true);
                Ok(handle.id)
            }
            Err(e) => {
                manager.set_connected(false);
                Err(e)
            }
        }
    }

    /// Soft teardown: end the session but keep the handle.
    ///
    /// No-op when not connected; transport failures are logged and ignored.
    pub async fn disconnect(&mut self) {
        let manager = self.manager;
        if !manager.is_connected() {
            return;
        }
        if let Some(handle) = self.device.as_mut() {
            handle.client.disconnect().await;
            info!(handle = %handle.id, "Printer disconnected");
        }
        manager.set_connected(false);
    }

    /// Hard teardown: disconnect, release the handle and forget it.
    pub async fn stop(&mut self) {
        self.release().await;
    }

    /// Release the current handle, wait for the stack to settle and allocate
    /// a new one.
    pub async fn recreate(&mut self) -> Result<HandleId, FaroError> {
        self.release().await;
        sleep(self.manager.timings.release_settle).await;
        self.allocate().await
    }

    /// Send a bitmap over the current session.
    pub async fn print(&mut self, bitmap: &Bitmap, options: &PrintOptions) -> Result<(), FaroError> {
        let handle = self
            .device
            .as_mut()
            .ok_or_else(|| FaroError::Transport("no device handle".to_string()))?;
        handle.client.print(bitmap, options).await?;
        Ok(())
    }

    /// Scan for printers, bounded by the configured scan timeout.
    pub async fn scan(&mut self, name_filter: &str, timeout: Duration) -> Result<ScanResult, FaroError> {
        self.ensure_handle().await?;
        let timeout = timeout.min(self.manager.timings.scan_timeout);
        let handle = self
            .device
            .as_mut()
            .ok_or_else(|| FaroError::Transport("no device handle".to_string()))?;

        match tokio::time::timeout(timeout, handle.client.scan(name_filter)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FaroError::Transport(format!(
                "scan timeout after {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn allocate(&mut self) -> Result<HandleId, FaroError> {
        let client = self.manager.factory.new_client().await?;
        let id = HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        info!(handle = %id, "Device handle allocated");
        *self.device = Some(DeviceHandle {
            id,
            client: GuardedClient::new(client),
        });
        Ok(id)
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.device.take() {
            handle.client.disconnect().await;
            handle.client.release().await;
            info!(handle = %handle.id, "Device handle released");
        }
        self.manager.set_connected(false);
    }
}

async fn sleep(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
