use dropbox_core::db::{open_db, open_db_in_memory};
use dropbox_core::{
    BoxId, DeliveryError, DeliveryHandler, DeliveryJob, DeliveryQueue, DeliveryWorker,
    DeliveryWorkerConfig, HandlerError, JobStatus, ManualClock, RetryPolicy,
    SqliteDeliveryQueue, SystemClock, Submission,
};
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const T0: i64 = 1_700_000_000_000;

fn message(text: &str) -> Submission {
    Submission::new().with_field("message", text)
}

#[derive(Default)]
struct RecordingHandler {
    delivered: Mutex<Vec<BoxId>>,
}

impl DeliveryHandler for RecordingHandler {
    fn deliver(&self, job: &DeliveryJob) -> Result<(), HandlerError> {
        self.delivered.lock().unwrap().push(job.box_id);
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
struct FlakyHandler {
    failures: usize,
    calls: AtomicUsize,
}

impl DeliveryHandler for FlakyHandler {
    fn deliver(&self, _job: &DeliveryJob) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::Transient(format!(
                "smtp unavailable (call {call})"
            )))
        } else {
            Ok(())
        }
    }
}

fn insert_submitted_box(conn: &Connection, id: BoxId, submission: &Submission) {
    conn.execute(
        "INSERT INTO boxes (id, owner, created_at, expires_at, closed, closed_at, closed_reason, submission)
         VALUES (?1, ?2, ?3, ?4, 1, ?3, 'submitted', ?5);",
        rusqlite::params![
            id.to_string(),
            Uuid::new_v4().to_string(),
            T0,
            T0 + 60_000,
            submission.to_json().unwrap(),
        ],
    )
    .unwrap();
}

#[test]
fn enqueue_is_idempotent_per_box() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let box_id = Uuid::new_v4();

    queue.enqueue(box_id, &message("first")).unwrap();
    clock.advance(1_000);
    queue.enqueue(box_id, &message("second")).unwrap();

    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.payload, message("first"));
    assert_eq!(job.enqueued_at, T0);
    assert_eq!(job.attempts, 0);
    assert_eq!(queue.count(JobStatus::Pending).unwrap(), 1);
}

#[test]
fn claim_due_returns_pending_jobs_in_enqueue_order() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let ids: Vec<BoxId> = (0..3).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        queue.enqueue(*id, &message("hi")).unwrap();
    }
    queue.mark_delivered(ids[1]).unwrap();

    let due: Vec<BoxId> = queue
        .claim_due(10)
        .unwrap()
        .into_iter()
        .map(|job| job.box_id)
        .collect();
    assert_eq!(due, vec![ids[0], ids[2]]);

    let limited = queue.claim_due(1).unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].box_id, ids[0]);
}

#[test]
fn mark_delivered_records_time_and_attempt() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    clock.advance(250);
    assert!(queue.mark_delivered(box_id).unwrap());
    assert!(!queue.mark_delivered(box_id).unwrap());

    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.delivered_at, Some(T0 + 250));
    assert!(queue.claim_due(10).unwrap().is_empty());
}

#[test]
fn mark_retry_backs_off_then_gives_up() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1_000,
        max_delay_ms: 1_500,
    };
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    assert_eq!(
        queue.mark_retry(box_id, "timeout", &policy).unwrap(),
        JobStatus::Pending
    );
    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.next_attempt_at, T0 + 1_000);
    assert_eq!(job.last_error.as_deref(), Some("timeout"));
    assert!(queue.claim_due(10).unwrap().is_empty());

    clock.advance(1_000);
    assert_eq!(queue.claim_due(10).unwrap().len(), 1);
    assert_eq!(
        queue.mark_retry(box_id, "timeout", &policy).unwrap(),
        JobStatus::Pending
    );
    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.next_attempt_at, T0 + 1_000 + 1_500);

    clock.advance(1_500);
    assert_eq!(
        queue.mark_retry(box_id, "rejected", &policy).unwrap(),
        JobStatus::Failed
    );
    assert_eq!(queue.count(JobStatus::Failed).unwrap(), 1);
    assert!(queue.claim_due(10).unwrap().is_empty());

    let err = queue.mark_retry(box_id, "again", &policy).unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidData(_)));
}

#[test]
fn enqueue_missing_covers_only_submitted_boxes_without_jobs() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let queued = Uuid::new_v4();
    let orphaned = Uuid::new_v4();
    insert_submitted_box(&conn, queued, &message("queued"));
    insert_submitted_box(&conn, orphaned, &message("orphaned"));
    queue.enqueue(queued, &message("queued")).unwrap();

    assert_eq!(queue.enqueue_missing().unwrap(), 1);
    assert_eq!(queue.enqueue_missing().unwrap(), 0);

    let job = queue.get_job(orphaned).unwrap().unwrap();
    assert_eq!(job.payload, message("orphaned"));
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(queue.count(JobStatus::Pending).unwrap(), 2);
}

#[test]
fn queue_requires_migrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteDeliveryQueue::try_new(&conn, SystemClock).err().unwrap();
    assert!(matches!(err, DeliveryError::UninitializedConnection { .. }));
}

#[test]
fn run_once_delivers_due_jobs() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let ids: Vec<BoxId> = (0..2).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        queue.enqueue(*id, &message("hi")).unwrap();
    }

    let handler = Arc::new(RecordingHandler::default());
    let worker = DeliveryWorker::new(
        Arc::clone(&handler),
        clock.clone(),
        DeliveryWorkerConfig::default(),
    );

    let stats = worker.run_once(&conn).unwrap();
    assert_eq!(stats.claimed, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(*handler.delivered.lock().unwrap(), ids);
    assert_eq!(queue.count(JobStatus::Delivered).unwrap(), 2);

    let idle = worker.run_once(&conn).unwrap();
    assert_eq!(idle.claimed, 0);
}

#[test]
fn run_once_reschedules_failures_until_they_succeed() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    let handler = Arc::new(FlakyHandler {
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let worker = DeliveryWorker::new(handler, clock.clone(), DeliveryWorkerConfig::default());
    let policy = RetryPolicy::default();

    let first = worker.run_once(&conn).unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(worker.run_once(&conn).unwrap().claimed, 0);

    clock.advance(policy.backoff_ms(1));
    assert_eq!(worker.run_once(&conn).unwrap().retried, 1);

    clock.advance(policy.backoff_ms(2));
    let last = worker.run_once(&conn).unwrap();
    assert_eq!(last.delivered, 1);

    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);
    assert_eq!(job.attempts, 3);
}

#[test]
fn run_once_marks_exhausted_jobs_failed() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    let handler = Arc::new(FlakyHandler {
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    let config = DeliveryWorkerConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        ..DeliveryWorkerConfig::default()
    };
    let worker = DeliveryWorker::new(handler, clock.clone(), config);

    let stats = worker.run_once(&conn).unwrap();
    assert_eq!(stats.failed, 1);
    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().starts_with("smtp unavailable"));
}

struct RejectingHandler;

impl DeliveryHandler for RejectingHandler {
    fn deliver(&self, _job: &DeliveryJob) -> Result<(), HandlerError> {
        Err(HandlerError::Permanent("mailbox does not exist".to_string()))
    }
}

#[test]
fn permanent_handler_error_fails_job_without_retry() {
    let conn = open_db_in_memory().unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    let worker = DeliveryWorker::new(
        Arc::new(RejectingHandler),
        clock.clone(),
        DeliveryWorkerConfig::default(),
    );
    let stats = worker.run_once(&conn).unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);

    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("mailbox does not exist"));
    assert!(!queue.mark_failed(box_id, "again").unwrap());
}

/// Delivers, then loses the ack race to another worker on the same file.
struct RacedAckHandler {
    db_path: PathBuf,
}

impl DeliveryHandler for RacedAckHandler {
    fn deliver(&self, job: &DeliveryJob) -> Result<(), HandlerError> {
        let conn = open_db(&self.db_path).unwrap();
        let queue = SqliteDeliveryQueue::try_new(&conn, ManualClock::new(T0)).unwrap();
        assert!(queue.mark_delivered(job.box_id).unwrap());
        Ok(())
    }
}

#[test]
fn run_once_counts_duplicate_acks_separately() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropbox.db");
    let conn = open_db(&path).unwrap();
    let clock = ManualClock::new(T0);
    let queue = SqliteDeliveryQueue::try_new(&conn, clock.clone()).unwrap();
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    let worker = DeliveryWorker::new(
        Arc::new(RacedAckHandler {
            db_path: path.clone(),
        }),
        clock.clone(),
        DeliveryWorkerConfig::default(),
    );
    let stats = worker.run_once(&conn).unwrap();

    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.duplicates, 1);
    let job = queue.get_job(box_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delivered);
    assert_eq!(job.attempts, 1);
}

#[test]
fn spawned_worker_drains_file_database_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropbox.db");
    let conn = open_db(&path).unwrap();
    let queue = SqliteDeliveryQueue::try_new(&conn, SystemClock).unwrap();
    let box_id = Uuid::new_v4();
    queue.enqueue(box_id, &message("hi")).unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let config = DeliveryWorkerConfig {
        poll_interval: Duration::from_millis(20),
        ..DeliveryWorkerConfig::default()
    };
    let handle = DeliveryWorker::new(Arc::clone(&handler), SystemClock, config)
        .spawn(path.clone())
        .unwrap();
    handle.wake();

    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.count(JobStatus::Delivered).unwrap() == 0 {
        assert!(Instant::now() < deadline, "worker did not deliver in time");
        thread::sleep(Duration::from_millis(10));
    }
    handle.stop().unwrap();

    assert_eq!(*handler.delivered.lock().unwrap(), vec![box_id]);
}
