//! Access decisions over resolved boxes.
//!
//! Pure functions of membership data; no storage access.

use crate::model::drop_box::DropBox;
use crate::model::membership::{AccessLevel, PrincipalId};

/// Whether `principal` holds at least `level` on `drop_box`.
///
/// The owner implicitly holds `Full`, even if its membership row is missing
/// from the resolved record.
pub fn has_access(principal: PrincipalId, drop_box: &DropBox, level: AccessLevel) -> bool {
    if principal == drop_box.owner {
        return true;
    }

    drop_box
        .memberships
        .iter()
        .any(|membership| membership.grants(principal, level))
}

/// Whether `principal` may perform owner-exclusive operations (delete,
/// share). Membership alone never qualifies.
pub fn is_owner(principal: PrincipalId, drop_box: &DropBox) -> bool {
    principal == drop_box.owner
}
