//! Core use-case services.
//!
//! # Responsibility
//! - Own every drop box state transition on top of store and queue
//!   contracts.
//! - Keep request-handling layers decoupled from storage details.

pub mod box_lifecycle;
