//! Drop box domain model.
//!
//! # Responsibility
//! - Define the box, membership and submission records shared by the store,
//!   the delivery queue and the lifecycle service.
//! - Keep model-level invariants checkable without a database.
//!
//! # Invariants
//! - A box id is never reused for another box.
//! - `closed` is terminal: no transition returns a box to open.
//! - A box carrying a submission is closed.

pub mod drop_box;
pub mod membership;
pub mod submission;
