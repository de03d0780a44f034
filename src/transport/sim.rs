//! # Simulated Printer
//!
//! An in-process stand-in for the BLE device library. Outcomes of `connect`
//! and `print` can be scripted, every call is counted, and the number of
//! overlapping calls is tracked so tests can prove that the device was never
//! driven from two tasks at once.
//!
//! ```
//! use faro::transport::sim::{Outcome, SimPrinter};
//!
//! let sim = SimPrinter::new();
//! sim.script_connect([Outcome::fail("already exists"), Outcome::Ok]);
//! let factory = sim.factory();
//! # let _ = factory;
//! ```
//!
//! The same simulator backs `faro serve --simulate`, which is handy for
//! exercising the HTTP controls without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ClientFactory, DeviceClient, PrintOptions, ScanResult, TransportError};
use crate::bitmap::Bitmap;

/// Scripted result of one simulated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Fail with the given raw message
    Fail(String),
    /// Panic with the given message
    Panic(String),
}

impl Outcome {
    pub fn fail(message: impl Into<String>) -> Self {
        Outcome::Fail(message.into())
    }

    fn apply(self) -> Result<(), TransportError> {
        match self {
            Outcome::Ok => Ok(()),
            Outcome::Fail(msg) => Err(TransportError::new(msg)),
            Outcome::Panic(msg) => panic!("{}", msg),
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub clients_created: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub releases: usize,
    pub prints: usize,
    pub scans: usize,
    /// Highest number of calls that were in progress at the same time
    pub max_in_flight: usize,
}

#[derive(Default)]
struct Shared {
    connect_script: Mutex<VecDeque<Outcome>>,
    print_script: Mutex<VecDeque<Outcome>>,
    client_script: Mutex<VecDeque<Outcome>>,
    devices: Mutex<ScanResult>,
    printed: Mutex<Vec<Bitmap>>,
    latency: Mutex<Duration>,
    next_client: AtomicU64,
    clients_created: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    releases: AtomicUsize,
    prints: AtomicUsize,
    scans: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Mark a call as in progress for its whole simulated duration.
    async fn call(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn next(script: &Mutex<VecDeque<Outcome>>) -> Outcome {
        lock(script).pop_front().unwrap_or(Outcome::Ok)
    }
}

/// Handle to a simulated printer. Cloning shares the same device.
#[derive(Clone, Default)]
pub struct SimPrinter {
    shared: Arc<Shared>,
}

impl SimPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming `connect` calls. Unscripted calls succeed.
    pub fn script_connect(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        lock(&self.shared.connect_script).extend(outcomes);
    }

    /// Queue outcomes for upcoming `print` calls. Unscripted calls succeed.
    pub fn script_print(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        lock(&self.shared.print_script).extend(outcomes);
    }

    /// Queue outcomes for upcoming client allocations.
    pub fn script_new_client(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        lock(&self.shared.client_script).extend(outcomes);
    }

    /// Time every simulated device call takes.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.shared.latency) = latency;
    }

    /// Make a device visible to scans.
    pub fn add_device(&self, address: &str, name: &str) {
        lock(&self.shared.devices).insert(address.to_string(), name.to_string());
    }

    /// A factory producing clients bound to this simulated printer.
    pub fn factory(&self) -> Arc<dyn ClientFactory> {
        Arc::new(SimFactory {
            shared: self.shared.clone(),
        })
    }

    pub fn stats(&self) -> SimStats {
        let s = &self.shared;
        SimStats {
            clients_created: s.clients_created.load(Ordering::SeqCst),
            connects: s.connects.load(Ordering::SeqCst),
            disconnects: s.disconnects.load(Ordering::SeqCst),
            releases: s.releases.load(Ordering::SeqCst),
            prints: s.prints.load(Ordering::SeqCst),
            scans: s.scans.load(Ordering::SeqCst),
            max_in_flight: s.max_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Bitmaps that reached a successful `print` call, in order.
    pub fn printed(&self) -> Vec<Bitmap> {
        lock(&self.shared.printed).clone()
    }
}

struct SimFactory {
    shared: Arc<Shared>,
}

#[async_trait]
impl ClientFactory for SimFactory {
    async fn new_client(&self) -> Result<Box<dyn DeviceClient>, TransportError> {
        Shared::next(&self.shared.client_script).apply()?;
        self.shared.clients_created.fetch_add(1, Ordering::SeqCst);
        let id = self.shared.next_client.fetch_add(1, Ordering::SeqCst);
        debug!(client = id, "Simulated client allocated");
        Ok(Box::new(SimClient {
            id,
            shared: self.shared.clone(),
            connected: false,
            released: false,
        }))
    }
}

struct SimClient {
    id: u64,
    shared: Arc<Shared>,
    connected: bool,
    released: bool,
}

impl SimClient {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.released {
            return Err(TransportError::new("client already released"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for SimClient {
    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.shared.call(&self.shared.connects).await;
        self.check_alive()?;
        if self.connected {
            return Err(TransportError::new("already connected"));
        }
        Shared::next(&self.shared.connect_script).apply()?;
        debug!(client = self.id, address, "Simulated connect");
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.shared.call(&self.shared.disconnects).await;
        self.connected = false;
        Ok(())
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        self.shared.call(&self.shared.releases).await;
        self.connected = false;
        self.released = true;
        Ok(())
    }

    async fn print(
        &mut self,
        bitmap: &Bitmap,
        _options: &PrintOptions,
    ) -> Result<(), TransportError> {
        self.shared.call(&self.shared.prints).await;
        self.check_alive()?;
        if !self.connected {
            return Err(TransportError::new("not connected"));
        }
        Shared::next(&self.shared.print_script).apply()?;
        lock(&self.shared.printed).push(bitmap.clone());
        Ok(())
    }

    async fn scan(&mut self, name_filter: &str) -> Result<ScanResult, TransportError> {
        self.shared.call(&self.shared.scans).await;
        self.check_alive()?;
        let devices = lock(&self.shared.devices);
        Ok(devices
            .iter()
            .filter(|(_, name)| name.contains(name_filter))
            .map(|(addr, name)| (addr.clone(), name.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_connect_reports_already_connected() {
        let sim = SimPrinter::new();
        let mut client = sim.factory().new_client().await.unwrap();

        client.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        let err = client.connect("AA:BB:CC:DD:EE:FF").await.unwrap_err();
        assert_eq!(err.message(), "already connected");
        assert_eq!(sim.stats().connects, 2);
    }

    #[tokio::test]
    async fn test_scripted_connect_outcomes() {
        let sim = SimPrinter::new();
        sim.script_connect([Outcome::fail("broken pipe")]);
        let mut client = sim.factory().new_client().await.unwrap();

        assert!(client.connect("AA:BB:CC:DD:EE:FF").await.is_err());
        assert!(client.connect("AA:BB:CC:DD:EE:FF").await.is_ok());
    }

    #[tokio::test]
    async fn test_print_requires_session() {
        let sim = SimPrinter::new();
        let mut client = sim.factory().new_client().await.unwrap();
        let bitmap = Bitmap::from_fn(8, 1, |_, _| true);

        assert!(client.print(&bitmap, &PrintOptions::default()).await.is_err());
        client.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        client.print(&bitmap, &PrintOptions::default()).await.unwrap();
        assert_eq!(sim.printed(), vec![bitmap]);
    }

    #[tokio::test]
    async fn test_scan_filters_by_name() {
        let sim = SimPrinter::new();
        sim.add_device("AA:BB:CC:DD:EE:01", "MXW01");
        sim.add_device("AA:BB:CC:DD:EE:02", "Headphones");
        let mut client = sim.factory().new_client().await.unwrap();

        let found = client.scan("MXW").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("AA:BB:CC:DD:EE:01").map(String::as_str), Some("MXW01"));
    }

    #[tokio::test]
    async fn test_released_client_is_dead() {
        let sim = SimPrinter::new();
        let mut client = sim.factory().new_client().await.unwrap();
        client.release().await.unwrap();

        let err = client.connect("AA:BB:CC:DD:EE:FF").await.unwrap_err();
        assert_eq!(err.message(), "client already released");
    }
}
