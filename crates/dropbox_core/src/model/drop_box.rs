//! Drop box domain record.
//!
//! # Responsibility
//! - Define the single-use, time-limited inbox and its close transitions.
//! - Provide model-level validation shared by write and read paths.
//!
//! # Invariants
//! - `expires_at` is strictly after `created_at` and never changes.
//! - `closed` is monotonic; `closed_reason` is set exactly when closed.
//! - `submission.is_some()` implies `closed` with reason `Submitted`.
//! - The owner always holds a `Full` membership.

use super::membership::{AccessLevel, Membership, PrincipalId};
use super::submission::Submission;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Public, unguessable box identifier embedded in share URLs.
///
/// Random v4 UUID; its hyphenated text form is URL-safe.
pub type BoxId = Uuid;

/// Parses a box id from untrusted text.
///
/// Returns `None` for malformed input so callers can fold it into the same
/// not-found outcome as an absent id.
pub fn parse_box_id(raw: &str) -> Option<BoxId> {
    Uuid::parse_str(raw.trim()).ok()
}

/// Why a box stopped accepting submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Accessed after `expires_at`.
    Expired,
    /// Accepted its one submission.
    Submitted,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Submitted => "submitted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expired" => Some(Self::Expired),
            "submitted" => Some(Self::Submitted),
            _ => None,
        }
    }
}

/// Conditional close applied by the store only while the box is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxTransition {
    /// Lazy expiration observed at `at`; applies only if `at > expires_at`.
    Expire { at: i64 },
    /// Accept `submission` at `at`; applies only if `at <= expires_at`.
    Submit { at: i64, submission: Submission },
}

impl BoxTransition {
    pub fn at(&self) -> i64 {
        match self {
            Self::Expire { at } | Self::Submit { at, .. } => *at,
        }
    }

    pub fn reason(&self) -> CloseReason {
        match self {
            Self::Expire { .. } => CloseReason::Expired,
            Self::Submit { .. } => CloseReason::Submitted,
        }
    }
}

/// Model validation error for drop box records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxValidationError {
    ExpiryNotAfterCreation { created_at: i64, expires_at: i64 },
    SubmissionOnOpenBox,
    SubmittedWithoutPayload,
    CloseReasonMismatch,
    MissingOwnerMembership,
    ForeignMembership(BoxId),
}

impl Display for BoxValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExpiryNotAfterCreation {
                created_at,
                expires_at,
            } => write!(
                f,
                "expires_at ({expires_at}) must be after created_at ({created_at})"
            ),
            Self::SubmissionOnOpenBox => write!(f, "an open box cannot carry a submission"),
            Self::SubmittedWithoutPayload => {
                write!(f, "a box closed by submission must carry the submission")
            }
            Self::CloseReasonMismatch => {
                write!(f, "close reason must be set exactly when the box is closed")
            }
            Self::MissingOwnerMembership => write!(f, "owner must hold a full membership"),
            Self::ForeignMembership(id) => write!(f, "membership belongs to another box: {id}"),
        }
    }
}

impl Error for BoxValidationError {}

/// Single-use, time-limited inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropBox {
    pub id: BoxId,
    pub owner: PrincipalId,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds; immutable after creation.
    pub expires_at: i64,
    pub closed: bool,
    pub closed_at: Option<i64>,
    pub closed_reason: Option<CloseReason>,
    pub submission: Option<Submission>,
    /// Resolved access grants, owner first.
    pub memberships: Vec<Membership>,
}

impl DropBox {
    /// Allocates a new open box with a random id and the owner's `Full`
    /// membership.
    pub fn new(owner: PrincipalId, created_at: i64, expires_at: i64) -> Self {
        Self::with_id(Uuid::new_v4(), owner, created_at, expires_at)
    }

    /// Same as [`DropBox::new`] with a caller-provided id.
    pub fn with_id(id: BoxId, owner: PrincipalId, created_at: i64, expires_at: i64) -> Self {
        Self {
            id,
            owner,
            created_at,
            expires_at,
            closed: false,
            closed_at: None,
            closed_reason: None,
            submission: None,
            memberships: vec![Membership::new(id, owner, AccessLevel::Full, created_at)],
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Whether `now` is past the expiry instant.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Whether lazy expiration should close this box when accessed at `now`.
    pub fn needs_expiry_at(&self, now: i64) -> bool {
        self.is_open() && self.is_expired_at(now)
    }

    /// Applies a transition in memory, mirroring the store's conditional
    /// update. Returns `false` and leaves the box untouched when the
    /// precondition does not hold.
    pub fn apply(&mut self, transition: &BoxTransition) -> bool {
        if self.closed {
            return false;
        }

        match transition {
            BoxTransition::Expire { at } if self.is_expired_at(*at) => {}
            BoxTransition::Submit { at, submission } if !self.is_expired_at(*at) => {
                self.submission = Some(submission.clone());
            }
            _ => return false,
        }

        self.closed = true;
        self.closed_at = Some(transition.at());
        self.closed_reason = Some(transition.reason());
        true
    }

    /// Validates model invariants.
    pub fn validate(&self) -> Result<(), BoxValidationError> {
        if self.expires_at <= self.created_at {
            return Err(BoxValidationError::ExpiryNotAfterCreation {
                created_at: self.created_at,
                expires_at: self.expires_at,
            });
        }

        if self.closed != self.closed_reason.is_some() {
            return Err(BoxValidationError::CloseReasonMismatch);
        }

        match (self.closed_reason, self.submission.is_some()) {
            (None, true) => return Err(BoxValidationError::SubmissionOnOpenBox),
            (Some(CloseReason::Submitted), false) => {
                return Err(BoxValidationError::SubmittedWithoutPayload)
            }
            (Some(CloseReason::Expired), true) => {
                return Err(BoxValidationError::CloseReasonMismatch)
            }
            _ => {}
        }

        if let Some(foreign) = self.memberships.iter().find(|m| m.box_id != self.id) {
            return Err(BoxValidationError::ForeignMembership(foreign.box_id));
        }

        if !self
            .memberships
            .iter()
            .any(|m| m.grants(self.owner, AccessLevel::Full))
        {
            return Err(BoxValidationError::MissingOwnerMembership);
        }

        Ok(())
    }
}
