//! Background worker draining the delivery outbox.
//!
//! # Invariants
//! - The worker owns its own connection; the request path never shares it.
//! - A handler error never drops a job: it is rescheduled or marked failed.
//! - Stopping the worker finishes the in-flight batch first.

use super::queue::{DeliveryJob, DeliveryResult, JobStatus, RetryPolicy, SqliteDeliveryQueue};
use crate::clock::Clock;
use crate::db::open_db;
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Why a [`DeliveryHandler`] could not deliver a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// May succeed later; the job is rescheduled with backoff.
    Transient(String),
    /// Will never succeed; the job is marked failed at once.
    Permanent(String),
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(reason) => write!(f, "transient delivery failure: {reason}"),
            Self::Permanent(reason) => write!(f, "permanent delivery failure: {reason}"),
        }
    }
}

impl Error for HandlerError {}

/// Consumer of delivery jobs (e.g. an email sender).
///
/// Must be idempotent per `job.box_id`: delivery is at-least-once.
pub trait DeliveryHandler: Send + Sync {
    fn deliver(&self, job: &DeliveryJob) -> Result<(), HandlerError>;
}

/// Worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryWorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub retry: RetryPolicy,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 20,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome counters for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryRunStats {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Delivered, but the job had already left `pending` before the ack.
    pub duplicates: usize,
}

/// Drains due jobs through a [`DeliveryHandler`].
pub struct DeliveryWorker<H: DeliveryHandler, C: Clock + Clone> {
    handler: Arc<H>,
    clock: C,
    config: DeliveryWorkerConfig,
}

impl<H: DeliveryHandler, C: Clock + Clone> DeliveryWorker<H, C> {
    pub fn new(handler: Arc<H>, clock: C, config: DeliveryWorkerConfig) -> Self {
        Self {
            handler,
            clock,
            config,
        }
    }

    /// Runs one drain pass over `conn`.
    pub fn run_once(&self, conn: &Connection) -> DeliveryResult<DeliveryRunStats> {
        let queue = SqliteDeliveryQueue::try_new(conn, self.clock.clone())?;
        let jobs = queue.claim_due(self.config.batch_size)?;
        let mut stats = DeliveryRunStats {
            claimed: jobs.len(),
            ..DeliveryRunStats::default()
        };

        for job in &jobs {
            match self.handler.deliver(job) {
                Ok(()) => {
                    info!(
                        "event=delivery_attempt module=delivery status=ok box_id={} attempt={}",
                        job.box_id,
                        job.attempts + 1
                    );
                    if queue.mark_delivered(job.box_id)? {
                        stats.delivered += 1;
                    } else {
                        stats.duplicates += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        "event=delivery_attempt module=delivery status=error box_id={} attempt={} error={}",
                        job.box_id,
                        job.attempts + 1,
                        err
                    );
                    match err {
                        HandlerError::Transient(reason) => {
                            match queue.mark_retry(job.box_id, &reason, &self.config.retry)? {
                                JobStatus::Failed => stats.failed += 1,
                                _ => stats.retried += 1,
                            }
                        }
                        HandlerError::Permanent(reason) => {
                            if queue.mark_failed(job.box_id, &reason)? {
                                stats.failed += 1;
                            }
                        }
                    }
                }
            }
        }

        if stats.claimed > 0 {
            debug!(
                "event=delivery_run module=delivery status=ok claimed={} delivered={} retried={} failed={} duplicates={}",
                stats.claimed, stats.delivered, stats.retried, stats.failed, stats.duplicates
            );
        }
        Ok(stats)
    }
}

impl<H, C> DeliveryWorker<H, C>
where
    H: DeliveryHandler + 'static,
    C: Clock + Clone + 'static,
{
    /// Starts the worker on a dedicated thread against the database file at
    /// `db_path`.
    pub fn spawn(self, db_path: impl Into<PathBuf>) -> std::io::Result<DeliveryWorkerHandle> {
        let db_path = db_path.into();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("dropbox-delivery".to_string())
            .spawn(move || {
                let conn = match open_db(&db_path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(
                            "event=delivery_worker module=delivery status=error error_code=db_open_failed error={}",
                            err
                        );
                        return;
                    }
                };

                info!("event=delivery_worker module=delivery status=start");
                while !stop_flag.load(Ordering::Acquire) {
                    if let Err(err) = self.run_once(&conn) {
                        error!(
                            "event=delivery_run module=delivery status=error error={}",
                            err
                        );
                    }
                    thread::park_timeout(self.config.poll_interval);
                }
                info!("event=delivery_worker module=delivery status=stop");
            })?;

        Ok(DeliveryWorkerHandle { stop, thread })
    }
}

/// Handle to a running [`DeliveryWorker`].
pub struct DeliveryWorkerHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl DeliveryWorkerHandle {
    /// Wakes the worker so it polls immediately.
    pub fn wake(&self) {
        self.thread.thread().unpark();
    }

    /// Signals the worker to stop and waits for it to exit.
    pub fn stop(self) -> thread::Result<()> {
        self.stop.store(true, Ordering::Release);
        self.thread.thread().unpark();
        self.thread.join()
    }
}
