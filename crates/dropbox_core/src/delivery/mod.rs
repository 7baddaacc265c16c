//! Out-of-band delivery of accepted submissions.
//!
//! # Responsibility
//! - Accept one delivery job per submitted box into a durable outbox.
//! - Drain the outbox on a background worker with its own retry policy.
//!
//! # Invariants
//! - The submit path only enqueues; it never waits on delivery.
//! - At most one job exists per box id, so consumers deduplicate by box id.
//! - Delivery is at-least-once: a handler may see the same job again after
//!   a crash between delivery and acknowledgement.

pub mod queue;
pub mod worker;
