//! # Keep-Alive Scheduler
//!
//! Periodically refreshes the printer connection so that the first print
//! after a quiet period does not pay for a reconnect, and so that a dropped
//! session is noticed before a job needs it.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped --start(interval)--> Running --stop()--> Stopped
//! ```
//!
//! `start` always stops a previous run first and waits for its task to exit,
//! so changing the interval never leaves two timers ticking. The first
//! maintenance cycle runs inside `start` itself; afterwards the task ticks
//! every `interval`.
//!
//! ## One Maintenance Cycle
//!
//! Runs under the manager's exclusivity lock:
//!
//! 1. No address configured: nothing to do.
//! 2. Believed connected: disconnect and let the transport settle.
//! 3. Make sure a handle exists.
//! 4. Connect. Success ends the cycle.
//! 5. On a transport-stack or handle-fatal fault, release the handle,
//!    allocate a new one and connect once more. Other faults only reset the
//!    status; the next cycle tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fault::FaultKind;
use crate::manager::ConnectionManager;

/// How a maintenance cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "error", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No printer address configured
    Skipped,
    /// Connected with the existing handle
    Connected,
    /// Connected after releasing and reallocating the handle
    Recovered,
    /// Could not connect; the next cycle will try again
    Failed(String),
}

/// Record of one keep-alive pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceCycle {
    pub address: Option<String>,
    /// The connection was torn down before reconnecting
    pub refreshed: bool,
    /// The handle was released and reallocated
    pub escalated: bool,
    pub outcome: CycleOutcome,
}

impl MaintenanceCycle {
    fn new(address: Option<String>) -> Self {
        Self {
            address,
            refreshed: false,
            escalated: false,
            outcome: CycleOutcome::Skipped,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.outcome,
            CycleOutcome::Connected | CycleOutcome::Recovered
        )
    }
}

/// Run one maintenance cycle against `manager`.
pub async fn maintenance_cycle(manager: &ConnectionManager) -> MaintenanceCycle {
    let address = manager.address();
    let mut cycle = MaintenanceCycle::new(address.clone());
    let Some(address) = address else {
        debug!("Keep-alive: no printer address configured");
        return cycle;
    };

    let timings = *manager.timings();
    let mut session = manager.session().await;

    if manager.is_connected() {
        session.disconnect().await;
        cycle.refreshed = true;
        if !timings.refresh_settle.is_zero() {
            tokio::time::sleep(timings.refresh_settle).await;
        }
    }

    if let Err(e) = session.ensure_handle().await {
        error!(address = %address, error = %e, "Keep-alive: could not allocate device handle");
        cycle.outcome = CycleOutcome::Failed(e.to_string());
        return cycle;
    }

    // Single attempts only: the escalation below is the cycle's one reset.
    let err = match session.connect_once(&address).await {
        Ok(handle) => {
            debug!(address = %address, handle = %handle, "Keep-alive: connection healthy");
            cycle.outcome = CycleOutcome::Connected;
            return cycle;
        }
        Err(e) => e.to_string(),
    };

    if !FaultKind::of(&err).escalates_in_maintenance() {
        warn!(address = %address, error = %err, "Keep-alive: connect failed");
        manager.reset_connection_status();
        cycle.outcome = CycleOutcome::Failed(err);
        return cycle;
    }

    warn!(address = %address, error = %err, "Keep-alive: transport fault, resetting device handle");
    cycle.escalated = true;
    let retry = match session.recreate().await {
        Ok(_) => session.connect_once(&address).await,
        Err(e) => Err(e),
    };

    match retry {
        Ok(handle) => {
            info!(address = %address, handle = %handle, "Keep-alive: recovered after handle reset");
            cycle.outcome = CycleOutcome::Recovered;
        }
        Err(e) => {
            error!(address = %address, error = %e, "Keep-alive: recovery failed");
            manager.reset_connection_status();
            cycle.outcome = CycleOutcome::Failed(e.to_string());
        }
    }
    cycle
}

struct KeepAliveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the single periodic keep-alive task.
///
/// `control` is held while a task is started or joined, which can take as
/// long as a BLE connect. Readers use the `running` snapshot instead.
pub struct KeepAliveScheduler {
    manager: Arc<ConnectionManager>,
    control: Mutex<Option<KeepAliveTask>>,
    running: RwLock<Option<Duration>>,
    cycles: Arc<AtomicU64>,
}

impl KeepAliveScheduler {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            control: Mutex::new(None),
            running: RwLock::new(None),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// (Re)start the scheduler.
    ///
    /// Stops any running task first, runs one cycle immediately and returns
    /// its record, then keeps ticking every `interval` in the background.
    pub async fn start(&self, interval: Duration) -> MaintenanceCycle {
        let mut control = self.control.lock().await;
        self.stop_task(control.take()).await;

        info!(interval_secs = interval.as_secs_f64(), "Keep-alive starting");
        self.set_running(Some(interval));
        let first = run_cycle(&self.manager, &self.cycles).await;
        *control = Some(self.spawn(interval));
        first
    }

    /// (Re)start the scheduler without the immediate cycle, for callers
    /// that have just connected themselves. The first tick is one
    /// `interval` from now.
    pub async fn schedule(&self, interval: Duration) {
        let mut control = self.control.lock().await;
        self.stop_task(control.take()).await;

        info!(interval_secs = interval.as_secs_f64(), "Keep-alive scheduled");
        *control = Some(self.spawn(interval));
        self.set_running(Some(interval));
    }

    fn spawn(&self, interval: Duration) -> KeepAliveTask {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            self.manager.clone(),
            self.cycles.clone(),
            interval,
            cancel.clone(),
        ));
        KeepAliveTask { cancel, handle }
    }

    /// Stop the scheduler and wait (bounded) for its task to exit.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        if control.is_some() {
            info!("Keep-alive stopping");
        }
        self.stop_task(control.take()).await;
    }

    /// Never waits on a start or stop in progress.
    pub fn is_running(&self) -> bool {
        self.interval().is_some()
    }

    /// Interval of the running task.
    pub fn interval(&self) -> Option<Duration> {
        *self.running.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_running(&self, interval: Option<Duration>) {
        *self.running.write().unwrap_or_else(PoisonError::into_inner) = interval;
    }

    /// Maintenance cycles run since creation.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    async fn stop_task(&self, task: Option<KeepAliveTask>) {
        let Some(task) = task else {
            return;
        };
        self.set_running(None);
        task.cancel.cancel();

        let grace = self.manager.timings().stop_grace;
        let abort = task.handle.abort_handle();
        match tokio::time::timeout(grace, task.handle).await {
            Ok(Ok(())) => debug!("Keep-alive task exited"),
            Ok(Err(e)) => warn!(error = %e, "Keep-alive task ended abnormally"),
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Keep-alive task did not exit in time, aborting"
                );
                abort.abort();
            }
        }
    }
}

async fn run_cycle(manager: &ConnectionManager, cycles: &AtomicU64) -> MaintenanceCycle {
    cycles.fetch_add(1, Ordering::SeqCst);
    maintenance_cycle(manager).await
}

async fn tick_loop(
    manager: Arc<ConnectionManager>,
    cycles: Arc<AtomicU64>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cycle = run_cycle(&manager, &cycles).await;
                debug!(outcome = ?cycle.outcome, "Keep-alive cycle finished");
            }
        }
    }
}
