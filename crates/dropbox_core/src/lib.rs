//! Core domain logic for single-use drop boxes.
//!
//! A drop box is a time-limited inbox an owner shares by an unguessable id.
//! It accepts exactly one anonymous submission, then closes for good. This
//! crate owns those state transitions; HTTP handling, sessions and
//! rendering live in the calling layer.

pub mod access;
pub mod clock;
pub mod db;
pub mod delivery;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use access::{has_access, is_owner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::queue::{
    DeliveryError, DeliveryJob, DeliveryQueue, DeliveryResult, JobStatus, RetryPolicy,
    SqliteDeliveryQueue,
};
pub use delivery::worker::{
    DeliveryHandler, DeliveryRunStats, DeliveryWorker, DeliveryWorkerConfig, DeliveryWorkerHandle,
    HandlerError,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::drop_box::{
    parse_box_id, BoxId, BoxTransition, BoxValidationError, CloseReason, DropBox,
};
pub use model::membership::{AccessLevel, Membership, PrincipalId};
pub use model::submission::{FieldError, FieldKind, FieldRule, Submission, SubmissionSchema};
pub use repo::box_repo::{
    BoxStore, OpenBoxPage, OpenBoxQuery, PageCursor, RepoError, RepoResult, SqliteBoxStore,
};
pub use service::box_lifecycle::{
    parse_expires_at, BoxLifecycle, BoxView, LifecycleConfig, LifecycleError, LifecycleResult,
    OpenBoxes, RejectReason, SubmitResult, ValidationError,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
