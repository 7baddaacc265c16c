//! Access grants linking principals to boxes.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

use super::drop_box::BoxId;

/// Identifier of an authenticated principal (account).
pub type PrincipalId = Uuid;

/// Access level carried by a membership.
///
/// Variants are declared from weakest to strongest so the derived ordering
/// answers "at least this level" checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AccessLevel {
    /// Owner-equivalent rights over the box.
    Full,
}

/// Storage value for [`AccessLevel::Full`].
pub const ACCESS_LEVEL_FULL: &str = "full";

impl AccessLevel {
    /// Stable string id used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => ACCESS_LEVEL_FULL,
        }
    }

    /// Parses a stored access level.
    pub fn parse(value: &str) -> Result<Self, AccessLevelError> {
        match value.trim() {
            "" => Err(AccessLevelError::Empty),
            ACCESS_LEVEL_FULL => Ok(Self::Full),
            other => Err(AccessLevelError::Unsupported(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessLevelError {
    Empty,
    Unsupported(String),
}

impl Display for AccessLevelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "access level must not be empty"),
            Self::Unsupported(value) => write!(f, "access level is unsupported: {value}"),
        }
    }
}

impl Error for AccessLevelError {}

/// Grant of `access` on `box_id` to `principal`.
///
/// Owned by its box: deleting the box deletes the membership. The principal
/// is only referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub box_id: BoxId,
    pub principal: PrincipalId,
    pub access: AccessLevel,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl Membership {
    pub fn new(box_id: BoxId, principal: PrincipalId, access: AccessLevel, created_at: i64) -> Self {
        Self {
            box_id,
            principal,
            access,
            created_at,
        }
    }

    /// Whether this grant gives `principal` at least `level` on its box.
    pub fn grants(&self, principal: PrincipalId, level: AccessLevel) -> bool {
        self.principal == principal && self.access >= level
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessLevel, AccessLevelError, Membership};
    use uuid::Uuid;

    #[test]
    fn parses_stored_access_levels() {
        assert_eq!(AccessLevel::parse("full"), Ok(AccessLevel::Full));
        assert_eq!(AccessLevel::parse("  "), Err(AccessLevelError::Empty));
        assert_eq!(
            AccessLevel::parse("FULL"),
            Err(AccessLevelError::Unsupported("FULL".to_string()))
        );
    }

    #[test]
    fn grants_only_matching_principal() {
        let principal = Uuid::new_v4();
        let membership = Membership::new(Uuid::new_v4(), principal, AccessLevel::Full, 0);

        assert!(membership.grants(principal, AccessLevel::Full));
        assert!(!membership.grants(Uuid::new_v4(), AccessLevel::Full));
    }
}
