//! # Print Dispatcher
//!
//! Producers hand finished bitmaps to a [`PrintQueue`]; a single
//! [`Dispatcher`] drains it in FIFO order and sends each job to the printer
//! while holding the connection manager's exclusivity lock.
//!
//! ## Delivery
//!
//! Jobs are delivered **at most once**. A job whose print fails is logged and
//! dropped, never requeued: a receipt that arrives minutes late is worse than
//! one that never arrives. Operators can watch the `failed` counter in
//! [`DispatchStats`].
//!
//! ## Back-pressure
//!
//! The queue is bounded. [`PrintQueue::submit`] never waits; when the queue is
//! full it fails immediately with [`FaroError::QueueFull`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bitmap::Bitmap;
use crate::config::SharedSettings;
use crate::error::FaroError;
use crate::manager::{ConnectionManager, Session};

/// Default number of jobs the queue holds before rejecting submissions.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

pub type JobId = Uuid;

/// A finished bitmap waiting to be printed.
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: JobId,
    pub bitmap: Arc<Bitmap>,
    pub submitted_at: DateTime<Utc>,
}

impl PrintJob {
    pub fn new(bitmap: Arc<Bitmap>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bitmap,
            submitted_at: Utc::now(),
        }
    }
}

/// Producer side of the job queue. Cheap to clone.
#[derive(Clone)]
pub struct PrintQueue {
    tx: mpsc::Sender<PrintJob>,
}

impl PrintQueue {
    /// Create a bounded queue and the receiver the dispatcher drains.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<PrintJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a bitmap without waiting.
    pub fn submit(&self, bitmap: Bitmap) -> Result<JobId, FaroError> {
        self.submit_shared(Arc::new(bitmap))
    }

    pub fn submit_shared(&self, bitmap: Arc<Bitmap>) -> Result<JobId, FaroError> {
        let job = PrintJob::new(bitmap);
        let id = job.id;
        match self.tx.try_send(job) {
            Ok(()) => {
                debug!(job = %id, "Job queued");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                warn!("Print queue full, rejecting job");
                Err(FaroError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(FaroError::QueueClosed),
        }
    }

    /// Free slots left in the queue.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// How one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Printed,
    /// Accepted in dry-run mode, nothing sent to the device
    DryRun,
    /// Dropped after a failed attempt
    Failed(String),
}

/// Dispatch counters and the time of the last successful job.
#[derive(Debug, Default)]
pub struct Activity {
    last_success: RwLock<Option<DateTime<Utc>>>,
    printed: AtomicU64,
    dry_run: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of [`Activity`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub printed: u64,
    pub dry_run: u64,
    pub failed: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_success.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            printed: self.printed.load(Ordering::SeqCst),
            dry_run: self.dry_run.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            last_activity: self.last_activity(),
        }
    }

    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Printed => &self.printed,
            JobOutcome::DryRun => &self.dry_run,
            JobOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        *self
            .last_success
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }
}

/// The single consumer of the print queue.
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    settings: SharedSettings,
    activity: Arc<Activity>,
    rx: mpsc::Receiver<PrintJob>,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<ConnectionManager>,
        settings: SharedSettings,
        activity: Arc<Activity>,
        rx: mpsc::Receiver<PrintJob>,
    ) -> Self {
        Self {
            manager,
            settings,
            activity,
            rx,
        }
    }

    /// Drain the queue until every [`PrintQueue`] handle is dropped.
    ///
    /// Jobs already queued when the last producer goes away are still
    /// processed before this returns.
    pub async fn run(mut self) {
        info!("Print dispatcher started");
        while let Some(job) = self.rx.recv().await {
            self.process(job).await;
        }
        info!("Print queue closed, dispatcher stopped");
    }

    /// Process one job under the exclusivity lock.
    pub async fn process(&self, job: PrintJob) -> JobOutcome {
        let settings = self.settings.snapshot();
        let waited = Utc::now() - job.submitted_at;
        debug!(job = %job.id, waited_ms = waited.num_milliseconds(), "Dispatching job");

        let outcome = {
            let mut session = self.manager.session().await;
            let ready = ensure_connected(&mut session).await;

            if settings.dry_run {
                if let Err(e) = ready {
                    debug!(job = %job.id, error = %e, "Dry run: printer unavailable");
                }
                info!(
                    job = %job.id,
                    width = job.bitmap.width(),
                    height = job.bitmap.height(),
                    "Dry run: job accepted, not sent"
                );
                JobOutcome::DryRun
            } else {
                match ready {
                    Err(e) => {
                        error!(job = %job.id, error = %e, "Printer unavailable, job dropped");
                        JobOutcome::Failed(e.to_string())
                    }
                    Ok(()) => match session.print(&job.bitmap, &settings.print_options).await {
                        Ok(()) => {
                            info!(job = %job.id, "Job printed");
                            JobOutcome::Printed
                        }
                        Err(e) => {
                            // At-most-once: the job is not requeued.
                            error!(job = %job.id, error = %e, "Print failed, job dropped");
                            self.manager.reset_connection_status();
                            JobOutcome::Failed(e.to_string())
                        }
                    },
                }
            }
        };

        self.activity.record(&outcome);
        outcome
    }
}

/// Make sure the session has a connected handle.
///
/// A failed first connect gets exactly one retry on a freshly allocated
/// handle.
async fn ensure_connected(session: &mut Session<'_>) -> Result<(), FaroError> {
    let manager = session.manager();
    if manager.is_connected() && session.handle_id().is_some() {
        return Ok(());
    }
    let address = manager.address().ok_or(FaroError::NoAddress)?;

    session.setup().await?;
    if let Err(e) = session.connect_once(&address).await {
        warn!(address = %address, error = %e, "Connect failed, retrying with a new handle");
        session.recreate().await?;
        session.connect_once(&address).await?;
    }
    Ok(())
}
