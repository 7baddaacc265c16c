//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the box store contract used by the lifecycle service.
//! - Isolate SQLite query details from lifecycle orchestration.
//!
//! # Invariants
//! - Writes validate the model before touching SQL.
//! - Close transitions are conditional writes; a lost precondition is
//!   reported as `false`, never as an overwrite.

pub mod box_repo;
