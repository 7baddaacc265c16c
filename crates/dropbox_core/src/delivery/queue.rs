//! Delivery queue contract and SQLite outbox implementation.

use crate::clock::Clock;
use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::drop_box::BoxId;
use crate::model::submission::Submission;
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const JOB_SELECT_SQL: &str = "SELECT
    box_id,
    payload,
    status,
    attempts,
    next_attempt_at,
    last_error,
    enqueued_at,
    delivered_at
FROM delivery_jobs";

const MAX_LAST_ERROR_CHARS: usize = 500;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Error raised by delivery queue operations.
#[derive(Debug)]
pub enum DeliveryError {
    Db(DbError),
    Payload(serde_json::Error),
    InvalidData(String),
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
}

impl Display for DeliveryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Payload(err) => write!(f, "delivery payload encoding failed: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted delivery job: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "delivery queue requires schema version {expected_version}, got {actual_version}"
            ),
        }
    }
}

impl Error for DeliveryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Payload(err) => Some(err),
            Self::InvalidData(_) | Self::UninitializedConnection { .. } => None,
        }
    }
}

impl From<DbError> for DeliveryError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for DeliveryError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Payload(value)
    }
}

/// Accepts one-shot delivery jobs for asynchronous processing.
///
/// Implementations must make a job durable before returning `Ok`.
pub trait DeliveryQueue {
    fn enqueue(&self, box_id: BoxId, payload: &Submission) -> DeliveryResult<()>;
}

/// Processing state of a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Delivered,
    /// Gave up after exhausting the retry policy.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persisted delivery job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    pub box_id: BoxId,
    pub payload: Submission,
    pub status: JobStatus,
    pub attempts: u32,
    /// Epoch ms before which the job is not handed to a worker.
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub enqueued_at: i64,
    pub delivered_at: Option<i64>,
}

/// Exponential backoff schedule for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts (including the first) before a job is marked failed.
    pub max_attempts: u32,
    pub initial_delay_ms: i64,
    pub max_delay_ms: i64,
}

impl Default for RetryPolicy {
    /// 30s first retry, doubling, capped at 8 minutes, five attempts.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 30_000,
            max_delay_ms: 480_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failed_attempts` failures.
    pub fn backoff_ms(&self, failed_attempts: u32) -> i64 {
        let exponent = failed_attempts.saturating_sub(1).min(30);
        self.initial_delay_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.max_delay_ms)
    }
}

/// SQLite outbox sharing the database with the box store.
pub struct SqliteDeliveryQueue<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
}

impl<'conn, C: Clock> SqliteDeliveryQueue<'conn, C> {
    /// Creates a queue from a migrated connection.
    pub fn try_new(conn: &'conn Connection, clock: C) -> DeliveryResult<Self> {
        let expected_version = latest_version();
        let actual_version: u32 =
            conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if actual_version != expected_version {
            return Err(DeliveryError::UninitializedConnection {
                expected_version,
                actual_version,
            });
        }
        Ok(Self { conn, clock })
    }

    /// Loads the job for one box, whatever its status.
    pub fn get_job(&self, box_id: BoxId) -> DeliveryResult<Option<DeliveryJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{JOB_SELECT_SQL} WHERE box_id = ?1;"))?;
        let mut rows = stmt.query([box_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_job_row(row)?));
        }
        Ok(None)
    }

    /// Returns up to `limit` pending jobs that are due, oldest first.
    pub fn claim_due(&self, limit: u32) -> DeliveryResult<Vec<DeliveryJob>> {
        let mut stmt = self.conn.prepare(&format!(
            "{JOB_SELECT_SQL}
             WHERE status = 'pending'
               AND next_attempt_at <= ?1
             ORDER BY seq ASC
             LIMIT ?2;"
        ))?;
        let mut rows = stmt.query(params![self.clock.now(), i64::from(limit.max(1))])?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(parse_job_row(row)?);
        }
        Ok(jobs)
    }

    /// Acknowledges a successful delivery.
    ///
    /// Returns `false` when the job is no longer pending, e.g. another worker
    /// already acknowledged it.
    pub fn mark_delivered(&self, box_id: BoxId) -> DeliveryResult<bool> {
        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE delivery_jobs
             SET
                status = 'delivered',
                attempts = attempts + 1,
                last_error = NULL,
                delivered_at = ?2
             WHERE box_id = ?1
               AND status = 'pending';",
            params![box_id.to_string(), now],
        )?;

        if changed == 0 {
            info!(
                "event=delivery_ack module=delivery status=duplicate box_id={}",
                box_id
            );
        }
        Ok(changed == 1)
    }

    /// Gives up on a pending job without further attempts.
    ///
    /// Returns `false` when the job is no longer pending.
    pub fn mark_failed(&self, box_id: BoxId, error: &str) -> DeliveryResult<bool> {
        let last_error: String = error.chars().take(MAX_LAST_ERROR_CHARS).collect();
        let changed = self.conn.execute(
            "UPDATE delivery_jobs
             SET
                status = 'failed',
                attempts = attempts + 1,
                last_error = ?2
             WHERE box_id = ?1
               AND status = 'pending';",
            params![box_id.to_string(), last_error],
        )?;

        if changed == 1 {
            warn!(
                "event=delivery_give_up module=delivery status=failed box_id={} reason=permanent",
                box_id
            );
        }
        Ok(changed == 1)
    }

    /// Records a failed attempt and schedules the next one, or marks the job
    /// failed once `policy.max_attempts` is reached. Returns the new status.
    pub fn mark_retry(
        &self,
        box_id: BoxId,
        error: &str,
        policy: &RetryPolicy,
    ) -> DeliveryResult<JobStatus> {
        let attempts: Option<u32> = self
            .conn
            .query_row(
                "SELECT attempts FROM delivery_jobs WHERE box_id = ?1 AND status = 'pending';",
                [box_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(DeliveryError::InvalidData(format!(
                "no pending delivery job for box {box_id}"
            )));
        };

        let failed_attempts = attempts + 1;
        let status = if failed_attempts >= policy.max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };
        let next_attempt_at = self
            .clock
            .now()
            .saturating_add(policy.backoff_ms(failed_attempts));
        let last_error: String = error.chars().take(MAX_LAST_ERROR_CHARS).collect();

        self.conn.execute(
            "UPDATE delivery_jobs
             SET
                status = ?2,
                attempts = ?3,
                next_attempt_at = ?4,
                last_error = ?5
             WHERE box_id = ?1
               AND status = 'pending';",
            params![
                box_id.to_string(),
                status.as_str(),
                failed_attempts,
                next_attempt_at,
                last_error,
            ],
        )?;

        if status == JobStatus::Failed {
            warn!(
                "event=delivery_give_up module=delivery status=failed box_id={} attempts={}",
                box_id, failed_attempts
            );
        }
        Ok(status)
    }

    /// Enqueues a job for every submitted box that has none.
    ///
    /// Repairs submissions whose enqueue failed after the box was closed.
    pub fn enqueue_missing(&self) -> DeliveryResult<usize> {
        let now = self.clock.now();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO delivery_jobs (
                box_id,
                payload,
                status,
                attempts,
                next_attempt_at,
                enqueued_at
            )
            SELECT b.id, b.submission, 'pending', 0, ?1, ?1
            FROM boxes b
            WHERE b.submission IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM delivery_jobs j WHERE j.box_id = b.id)
            ORDER BY b.seq ASC;",
            [now],
        )?;

        if inserted > 0 {
            info!(
                "event=delivery_reconcile module=delivery status=ok enqueued={}",
                inserted
            );
        }
        Ok(inserted)
    }

    /// Counts jobs in `status`.
    pub fn count(&self, status: JobStatus) -> DeliveryResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM delivery_jobs WHERE status = ?1;",
            [status.as_str()],
            |row| row.get(0),
        )?;
        usize::try_from(count)
            .map_err(|_| DeliveryError::InvalidData(format!("negative job count {count}")))
    }
}

impl<C: Clock> DeliveryQueue for SqliteDeliveryQueue<'_, C> {
    fn enqueue(&self, box_id: BoxId, payload: &Submission) -> DeliveryResult<()> {
        let now = self.clock.now();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO delivery_jobs (
                box_id,
                payload,
                status,
                attempts,
                next_attempt_at,
                enqueued_at
            ) VALUES (?1, ?2, 'pending', 0, ?3, ?3);",
            params![box_id.to_string(), payload.to_json()?, now],
        )?;

        if inserted == 0 {
            info!(
                "event=delivery_enqueue module=delivery status=duplicate box_id={}",
                box_id
            );
        }
        Ok(())
    }
}

fn parse_job_row(row: &Row<'_>) -> DeliveryResult<DeliveryJob> {
    let box_text: String = row.get("box_id")?;
    let box_id = Uuid::parse_str(&box_text).map_err(|_| {
        DeliveryError::InvalidData(format!(
            "invalid uuid value `{box_text}` in delivery_jobs.box_id"
        ))
    })?;

    let status_text: String = row.get("status")?;
    let status = JobStatus::parse(&status_text).ok_or_else(|| {
        DeliveryError::InvalidData(format!(
            "invalid status `{status_text}` in delivery_jobs.status"
        ))
    })?;

    let payload_text: String = row.get("payload")?;
    let payload = Submission::from_json(&payload_text).map_err(|err| {
        DeliveryError::InvalidData(format!("invalid payload json in delivery_jobs.payload: {err}"))
    })?;

    Ok(DeliveryJob {
        box_id,
        payload,
        status,
        attempts: row.get("attempts")?,
        next_attempt_at: row.get("next_attempt_at")?,
        last_error: row.get("last_error")?,
        enqueued_at: row.get("enqueued_at")?,
        delivered_at: row.get("delivered_at")?,
    })
}
