//! Operations entry point for a drop box database.
//!
//! Usage: `dropbox_cli <db_path> <status|sweep|reconcile>`
//!
//! - `status`: schema version and delivery outbox counters.
//! - `sweep`: close every open box already past its expiry.
//! - `reconcile`: enqueue delivery for submissions that have no job.
//!
//! Logs go to `$DROPBOX_LOG_DIR` when set (absolute path).

use dropbox_core::db::migrations::current_version;
use dropbox_core::db::open_db;
use dropbox_core::{
    core_version, default_log_level, init_logging, BoxLifecycle, JobStatus, SqliteBoxStore,
    SqliteDeliveryQueue, SystemClock,
};
use std::error::Error;
use std::process::ExitCode;

const USAGE: &str = "usage: dropbox_cli <db_path> <status|sweep|reconcile>";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (db_path, command) = match args.as_slice() {
        [db_path, command] => (db_path.as_str(), command.as_str()),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    if let Ok(log_dir) = std::env::var("DROPBOX_LOG_DIR") {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    match run(db_path, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("event=cli_command module=cli status=error command={command} error={err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(db_path: &str, command: &str) -> Result<(), Box<dyn Error>> {
    let conn = open_db(db_path)?;
    let store = SqliteBoxStore::try_new(&conn)?;
    let queue = SqliteDeliveryQueue::try_new(&conn, SystemClock)?;

    match command {
        "status" => {
            println!("dropbox_core version={}", core_version());
            println!("schema_version={}", current_version(&conn)?);
            for status in [JobStatus::Pending, JobStatus::Delivered, JobStatus::Failed] {
                println!("delivery_{}={}", status.as_str(), queue.count(status)?);
            }
        }
        "sweep" => {
            let lifecycle = BoxLifecycle::new(store, queue, SystemClock);
            println!("closed={}", lifecycle.sweep_expired()?);
        }
        "reconcile" => {
            println!("enqueued={}", queue.enqueue_missing()?);
        }
        other => return Err(format!("unknown command `{other}`; {USAGE}").into()),
    }

    Ok(())
}
