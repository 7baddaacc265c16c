//! Drop box lifecycle service.
//!
//! # Responsibility
//! - Create boxes with their owner membership, list and delete them.
//! - Resolve boxes for anonymous submitters, materializing expiry lazily.
//! - Accept at most one submission per box and hand it to delivery.
//!
//! # Invariants
//! - The service holds no durable state; every operation re-reads the store.
//! - Malformed, absent and not-owned ids all surface as `NotFound`.
//! - A lost conditional write during submit is reported as `Rejected`, never
//!   as an error.
//! - Enqueue runs only after the submission commits, and its failure never
//!   reopens the box.

use crate::access::{has_access, is_owner};
use crate::clock::Clock;
use crate::delivery::queue::DeliveryQueue;
use crate::model::drop_box::{parse_box_id, BoxId, BoxTransition, CloseReason, DropBox};
use crate::model::membership::{AccessLevel, Membership, PrincipalId};
use crate::model::submission::{FieldError, Submission, SubmissionSchema};
use crate::repo::box_repo::{BoxStore, OpenBoxQuery, PageCursor, RepoError};
use chrono::DateTime;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Bad caller input; nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MalformedExpiry(String),
    ExpiryNotInFuture { now: i64, expires_at: i64 },
    ExpiryTooFar { expires_at: i64, latest_allowed: i64 },
    ShareWithOwner,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedExpiry(raw) => write!(f, "expiration `{raw}` is not a valid timestamp"),
            Self::ExpiryNotInFuture { now, expires_at } => {
                write!(f, "expiration {expires_at} is not after current time {now}")
            }
            Self::ExpiryTooFar {
                expires_at,
                latest_allowed,
            } => write!(
                f,
                "expiration {expires_at} is later than the allowed {latest_allowed}"
            ),
            Self::ShareWithOwner => write!(f, "the owner already has full access"),
        }
    }
}

impl Error for ValidationError {}

/// Lifecycle operation error.
#[derive(Debug)]
pub enum LifecycleError {
    Validation(ValidationError),
    /// Unknown, malformed or not-owned box id.
    NotFound,
    /// Known box, insufficient rights.
    AccessDenied,
    Storage(RepoError),
    /// Lost a conditional close to a concurrent writer.
    Conflict(BoxId),
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound => write!(f, "box not found"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Conflict(id) => write!(f, "box was closed concurrently: {id}"),
        }
    }
}

impl Error for LifecycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for LifecycleError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<RepoError> for LifecycleError {
    fn from(value: RepoError) -> Self {
        Self::Storage(value)
    }
}

/// Why a submission was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Expired, already submitted, or deleted while in flight.
    Closed,
}

/// Outcome of [`BoxLifecycle::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(RejectReason),
    /// Payload failed the form schema; the box stays open for a retry.
    Invalid(Vec<FieldError>),
}

/// What an anonymous submitter may learn about a box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxView {
    pub box_id: BoxId,
    pub owner: PrincipalId,
    pub expires_at: i64,
    pub closed: bool,
    pub closed_reason: Option<CloseReason>,
}

impl BoxView {
    fn from_box(drop_box: &DropBox) -> Self {
        Self {
            box_id: drop_box.id,
            owner: drop_box.owner,
            expires_at: drop_box.expires_at,
            closed: drop_box.closed,
            closed_reason: drop_box.closed_reason,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }
}

/// Lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Expected submission form.
    pub schema: SubmissionSchema,
    /// Optional upper bound on `expires_at - now` at creation.
    pub max_lifetime_ms: Option<i64>,
    /// Page size used by [`OpenBoxes`].
    pub list_page_size: Option<u32>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            schema: SubmissionSchema::default(),
            max_lifetime_ms: None,
            list_page_size: None,
        }
    }
}

/// Parses an expiration given as RFC 3339 text or integer epoch
/// milliseconds.
pub fn parse_expires_at(raw: &str) -> Result<i64, ValidationError> {
    let trimmed = raw.trim();
    if let Ok(epoch_ms) = trimmed.parse::<i64>() {
        return Ok(epoch_ms);
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|parsed| parsed.timestamp_millis())
        .map_err(|_| ValidationError::MalformedExpiry(trimmed.to_string()))
}

/// Lazy, restartable iterator over one owner's open boxes.
///
/// Pages are fetched on demand; calling [`BoxLifecycle::list_open`] again
/// starts a fresh snapshot.
pub struct OpenBoxes<'a, S: BoxStore> {
    store: &'a S,
    owner: PrincipalId,
    page_size: Option<u32>,
    buffered: std::vec::IntoIter<DropBox>,
    cursor: Option<PageCursor>,
    exhausted: bool,
}

impl<S: BoxStore> Iterator for OpenBoxes<'_, S> {
    type Item = LifecycleResult<DropBox>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(drop_box) = self.buffered.next() {
                return Some(Ok(drop_box));
            }
            if self.exhausted {
                return None;
            }

            let query = OpenBoxQuery {
                after: self.cursor,
                limit: self.page_size,
            };
            match self.store.list_open_by_owner(self.owner, &query) {
                Ok(page) => {
                    self.exhausted = page.next.is_none();
                    self.cursor = page.next;
                    self.buffered = page.items.into_iter();
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

/// Stateless coordinator over a box store, a delivery queue and a clock.
pub struct BoxLifecycle<S: BoxStore, Q: DeliveryQueue, C: Clock> {
    store: S,
    queue: Q,
    clock: C,
    config: LifecycleConfig,
}

impl<S: BoxStore, Q: DeliveryQueue, C: Clock> BoxLifecycle<S, Q, C> {
    pub fn new(store: S, queue: Q, clock: C) -> Self {
        Self::with_config(store, queue, clock, LifecycleConfig::default())
    }

    pub fn with_config(store: S, queue: Q, clock: C, config: LifecycleConfig) -> Self {
        Self {
            store,
            queue,
            clock,
            config,
        }
    }

    /// Current time from the injected clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Creates an open box for `owner` expiring at `expires_at`.
    ///
    /// # Errors
    /// - `Validation` when `expires_at` is not after now or exceeds the
    ///   configured lifetime; nothing is persisted.
    /// - `Storage` when the box or its owner membership cannot be written;
    ///   neither is persisted.
    pub fn create(&self, owner: PrincipalId, expires_at: i64) -> LifecycleResult<DropBox> {
        let now = self.clock.now();
        self.check_expiry(now, expires_at)?;

        let drop_box = DropBox::new(owner, now, expires_at);
        self.store.insert_box(&drop_box)?;

        info!(
            "event=box_create module=lifecycle status=ok box_id={} ttl_ms={}",
            drop_box.id,
            expires_at - now
        );
        Ok(drop_box)
    }

    /// [`BoxLifecycle::create`] with an unparsed expiration.
    pub fn create_from_input(
        &self,
        owner: PrincipalId,
        raw_expires_at: &str,
    ) -> LifecycleResult<DropBox> {
        let expires_at = parse_expires_at(raw_expires_at)?;
        self.create(owner, expires_at)
    }

    /// Open boxes owned by `owner`, oldest first.
    pub fn list_open(&self, owner: PrincipalId) -> OpenBoxes<'_, S> {
        OpenBoxes {
            store: &self.store,
            owner,
            page_size: self.config.list_page_size,
            buffered: Vec::new().into_iter(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Loads a box for its owner.
    pub fn get_owned(&self, owner: PrincipalId, raw_id: &str) -> LifecycleResult<DropBox> {
        let id = parse_box_id(raw_id).ok_or(LifecycleError::NotFound)?;
        match self.store.get_box(id)? {
            Some(drop_box) if is_owner(owner, &drop_box) => Ok(drop_box),
            _ => Err(LifecycleError::NotFound),
        }
    }

    /// Deletes a box and its memberships. Owner-exclusive.
    pub fn delete(&self, owner: PrincipalId, raw_id: &str) -> LifecycleResult<()> {
        let id = parse_box_id(raw_id).ok_or(LifecycleError::NotFound)?;
        if !self.store.delete_owned_box(owner, id)? {
            debug!(
                "event=box_delete module=lifecycle status=not_found box_id={}",
                id
            );
            return Err(LifecycleError::NotFound);
        }

        info!("event=box_delete module=lifecycle status=ok box_id={}", id);
        Ok(())
    }

    /// Grants `principal` access to a box owned by `owner`.
    ///
    /// # Errors
    /// - `NotFound` when the box is absent or the caller cannot see it.
    /// - `AccessDenied` when the caller is a member but not the owner.
    pub fn share(
        &self,
        owner: PrincipalId,
        raw_id: &str,
        principal: PrincipalId,
        level: AccessLevel,
    ) -> LifecycleResult<Membership> {
        let id = parse_box_id(raw_id).ok_or(LifecycleError::NotFound)?;
        let drop_box = self.store.get_box(id)?.ok_or(LifecycleError::NotFound)?;

        if !is_owner(owner, &drop_box) {
            return Err(if has_access(owner, &drop_box, AccessLevel::Full) {
                LifecycleError::AccessDenied
            } else {
                LifecycleError::NotFound
            });
        }
        if principal == drop_box.owner {
            return Err(ValidationError::ShareWithOwner.into());
        }

        let membership = Membership::new(id, principal, level, self.clock.now());
        self.store.put_membership(&membership)?;
        info!(
            "event=box_share module=lifecycle status=ok box_id={} access={}",
            id,
            level.as_str()
        );
        Ok(membership)
    }

    /// Resolves a box for an anonymous submitter at `now`.
    ///
    /// An open box past its expiry is closed before the view is returned.
    pub fn resolve_for_submission(&self, raw_id: &str, now: i64) -> LifecycleResult<BoxView> {
        let drop_box = self.resolve(raw_id, now)?;
        Ok(BoxView::from_box(&drop_box))
    }

    /// Accepts `payload` into the box if it is open and the payload is
    /// valid. At most one call per box ever returns `Accepted`.
    pub fn submit(
        &self,
        raw_id: &str,
        now: i64,
        payload: Submission,
    ) -> LifecycleResult<SubmitResult> {
        let drop_box = self.resolve(raw_id, now)?;
        if drop_box.closed {
            debug!(
                "event=box_submit module=lifecycle status=rejected box_id={} reason={}",
                drop_box.id,
                drop_box.closed_reason.map_or("unknown", CloseReason::as_str)
            );
            return Ok(SubmitResult::Rejected(RejectReason::Closed));
        }

        if let Err(errors) = self.config.schema.validate(&payload) {
            debug!(
                "event=box_submit module=lifecycle status=invalid box_id={} error_count={}",
                drop_box.id,
                errors.len()
            );
            return Ok(SubmitResult::Invalid(errors));
        }

        let transition = BoxTransition::Submit {
            at: now,
            submission: payload,
        };
        match self.commit(drop_box.id, &transition) {
            Ok(()) => {}
            Err(LifecycleError::Conflict(id)) => {
                debug!(
                    "event=box_submit module=lifecycle status=rejected box_id={} reason=lost_race",
                    id
                );
                return Ok(SubmitResult::Rejected(RejectReason::Closed));
            }
            Err(err) => return Err(err),
        }

        info!(
            "event=box_submit module=lifecycle status=accepted box_id={}",
            drop_box.id
        );
        if let BoxTransition::Submit { submission, .. } = &transition {
            self.dispatch_delivery(drop_box.id, submission);
        }
        Ok(SubmitResult::Accepted)
    }

    /// Closes every open box already past its expiry.
    ///
    /// Optional; lazy expiration on access gives the same observable
    /// behavior.
    pub fn sweep_expired(&self) -> LifecycleResult<usize> {
        let closed = self.store.close_expired(self.clock.now())?;
        if closed > 0 {
            info!(
                "event=box_sweep module=lifecycle status=ok closed={}",
                closed
            );
        }
        Ok(closed)
    }

    fn check_expiry(&self, now: i64, expires_at: i64) -> Result<(), ValidationError> {
        if expires_at <= now {
            return Err(ValidationError::ExpiryNotInFuture { now, expires_at });
        }
        if let Some(max_lifetime_ms) = self.config.max_lifetime_ms {
            let latest_allowed = now.saturating_add(max_lifetime_ms);
            if expires_at > latest_allowed {
                return Err(ValidationError::ExpiryTooFar {
                    expires_at,
                    latest_allowed,
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, raw_id: &str, now: i64) -> LifecycleResult<DropBox> {
        let id = parse_box_id(raw_id).ok_or(LifecycleError::NotFound)?;
        let mut drop_box = self.store.get_box(id)?.ok_or(LifecycleError::NotFound)?;

        if !drop_box.needs_expiry_at(now) {
            return Ok(drop_box);
        }

        let transition = BoxTransition::Expire { at: now };
        match self.commit(id, &transition) {
            Ok(()) => {
                drop_box.apply(&transition);
                info!(
                    "event=box_expire module=lifecycle status=ok box_id={} overdue_ms={}",
                    id,
                    now - drop_box.expires_at
                );
            }
            Err(LifecycleError::Conflict(_)) => {
                // Closed by someone else in between; report what they wrote.
                drop_box = self.store.get_box(id)?.ok_or(LifecycleError::NotFound)?;
            }
            Err(err) => {
                // Best effort: the view is closed regardless, the next access
                // retries the write.
                warn!(
                    "event=box_expire module=lifecycle status=error box_id={} error={}",
                    id, err
                );
                drop_box.apply(&transition);
            }
        }

        Ok(drop_box)
    }

    fn commit(&self, id: BoxId, transition: &BoxTransition) -> LifecycleResult<()> {
        if self.store.close_if_open(id, transition)? {
            Ok(())
        } else {
            Err(LifecycleError::Conflict(id))
        }
    }

    fn dispatch_delivery(&self, id: BoxId, submission: &Submission) {
        match self.queue.enqueue(id, submission) {
            Ok(()) => info!(
                "event=delivery_enqueue module=lifecycle status=ok box_id={}",
                id
            ),
            Err(err) => error!(
                "event=delivery_enqueue module=lifecycle status=error box_id={} error_code=enqueue_failed error={}",
                id, err
            ),
        }
    }
}
