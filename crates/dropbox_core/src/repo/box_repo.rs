//! Box store contract and SQLite implementation.
//!
//! # Responsibility
//! - Persist boxes and memberships as one unit.
//! - Provide the conditional close used for lazy expiration and the
//!   single-submission guarantee.
//!
//! # Invariants
//! - `insert_box` writes the box and all its memberships in one transaction.
//! - `close_if_open` is a single `UPDATE ... WHERE closed = 0`; the
//!   affected-row count decides the winner across connections.
//! - Read paths reject invalid persisted state instead of masking it.
//! - Open-box listing is ordered by creation sequence.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::drop_box::{BoxId, BoxTransition, BoxValidationError, CloseReason, DropBox};
use crate::model::membership::{AccessLevel, Membership, PrincipalId};
use crate::model::submission::Submission;
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const BOX_SELECT_SQL: &str = "SELECT
    seq,
    id,
    owner,
    created_at,
    expires_at,
    closed,
    closed_at,
    closed_reason,
    submission
FROM boxes";

const OPEN_BOXES_DEFAULT_LIMIT: u32 = 50;
const OPEN_BOXES_LIMIT_MAX: u32 = 500;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for box persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(BoxValidationError),
    Db(DbError),
    Payload(serde_json::Error),
    InvalidData(String),
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Payload(err) => write!(f, "submission payload encoding failed: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted box data: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "box repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "box repository requires table `{table}`")
            }
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Payload(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BoxValidationError> for RepoError {
    fn from(value: BoxValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::Payload(value)
    }
}

/// Opaque position in an owner's open-box listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor(i64);

/// Page request for open boxes of one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenBoxQuery {
    /// Resume after this cursor. `None` starts from the oldest box.
    pub after: Option<PageCursor>,
    /// Maximum rows to return. Defaults to 50 and clamps to 500.
    pub limit: Option<u32>,
}

/// One page of open boxes in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBoxPage {
    pub items: Vec<DropBox>,
    /// Present when more rows may follow.
    pub next: Option<PageCursor>,
}

/// Durable keyed storage for boxes and memberships.
pub trait BoxStore {
    /// Persists a new box together with its memberships.
    fn insert_box(&self, drop_box: &DropBox) -> RepoResult<()>;
    /// Loads a fully resolved box (memberships included).
    fn get_box(&self, id: BoxId) -> RepoResult<Option<DropBox>>;
    /// Applies `transition` only if the box is still open and the
    /// transition's expiry precondition holds. Returns whether this call
    /// performed the close.
    fn close_if_open(&self, id: BoxId, transition: &BoxTransition) -> RepoResult<bool>;
    /// Deletes the box (and its memberships) when owned by `owner`.
    fn delete_owned_box(&self, owner: PrincipalId, id: BoxId) -> RepoResult<bool>;
    /// Lists open boxes owned by `owner` in creation order.
    fn list_open_by_owner(
        &self,
        owner: PrincipalId,
        query: &OpenBoxQuery,
    ) -> RepoResult<OpenBoxPage>;
    /// Creates or replaces one membership on an existing box.
    fn put_membership(&self, membership: &Membership) -> RepoResult<()>;
    /// Lists memberships of one box, owner first.
    fn list_memberships(&self, id: BoxId) -> RepoResult<Vec<Membership>>;
    /// Closes every open box whose expiry is before `now`.
    fn close_expired(&self, now: i64) -> RepoResult<usize>;
}

/// SQLite-backed box store.
pub struct SqliteBoxStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteBoxStore<'conn> {
    /// Creates a store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_box_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl BoxStore for SqliteBoxStore<'_> {
    fn insert_box(&self, drop_box: &DropBox) -> RepoResult<()> {
        drop_box.validate()?;
        let submission = drop_box
            .submission
            .as_ref()
            .map(Submission::to_json)
            .transpose()?;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO boxes (
                id,
                owner,
                created_at,
                expires_at,
                closed,
                closed_at,
                closed_reason,
                submission
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                drop_box.id.to_string(),
                drop_box.owner.to_string(),
                drop_box.created_at,
                drop_box.expires_at,
                bool_to_int(drop_box.closed),
                drop_box.closed_at,
                drop_box.closed_reason.map(CloseReason::as_str),
                submission,
            ],
        )?;

        for membership in &drop_box.memberships {
            upsert_membership(&tx, membership)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_box(&self, id: BoxId) -> RepoResult<Option<DropBox>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{BOX_SELECT_SQL} WHERE id = ?1;"))?;

        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            let parsed = parse_box_row(row)?;
            return Ok(Some(resolve_box(self.conn, parsed)?));
        }

        Ok(None)
    }

    fn close_if_open(&self, id: BoxId, transition: &BoxTransition) -> RepoResult<bool> {
        let changed = match transition {
            BoxTransition::Expire { at } => self.conn.execute(
                "UPDATE boxes
                 SET
                    closed = 1,
                    closed_at = ?2,
                    closed_reason = 'expired'
                 WHERE id = ?1
                   AND closed = 0
                   AND expires_at < ?2;",
                params![id.to_string(), at],
            )?,
            BoxTransition::Submit { at, submission } => self.conn.execute(
                "UPDATE boxes
                 SET
                    closed = 1,
                    closed_at = ?2,
                    closed_reason = 'submitted',
                    submission = ?3
                 WHERE id = ?1
                   AND closed = 0
                   AND expires_at >= ?2;",
                params![id.to_string(), at, submission.to_json()?],
            )?,
        };

        Ok(changed == 1)
    }

    fn delete_owned_box(&self, owner: PrincipalId, id: BoxId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM boxes WHERE id = ?1 AND owner = ?2;",
            params![id.to_string(), owner.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn list_open_by_owner(
        &self,
        owner: PrincipalId,
        query: &OpenBoxQuery,
    ) -> RepoResult<OpenBoxPage> {
        let limit = normalize_open_box_limit(query.limit);
        let after_seq = query.after.map_or(0, |cursor| cursor.0);

        let mut stmt = self.conn.prepare(&format!(
            "{BOX_SELECT_SQL}
             WHERE owner = ?1
               AND closed = 0
               AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3;"
        ))?;
        let mut rows = stmt.query(params![owner.to_string(), after_seq, i64::from(limit)])?;

        let mut parsed = Vec::new();
        while let Some(row) = rows.next()? {
            parsed.push(parse_box_row(row)?);
        }

        let next = if parsed.len() == limit as usize {
            parsed.last().map(|row| PageCursor(row.seq))
        } else {
            None
        };

        let items = parsed
            .into_iter()
            .map(|row| resolve_box(self.conn, row))
            .collect::<RepoResult<Vec<_>>>()?;

        Ok(OpenBoxPage { items, next })
    }

    fn put_membership(&self, membership: &Membership) -> RepoResult<()> {
        upsert_membership(self.conn, membership)
    }

    fn list_memberships(&self, id: BoxId) -> RepoResult<Vec<Membership>> {
        load_memberships(self.conn, id)
    }

    fn close_expired(&self, now: i64) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE boxes
             SET
                closed = 1,
                closed_at = ?1,
                closed_reason = 'expired'
             WHERE closed = 0
               AND expires_at < ?1;",
            [now],
        )?;
        Ok(changed)
    }
}

/// Normalizes page size for open-box listing.
pub fn normalize_open_box_limit(limit: Option<u32>) -> u32 {
    limit
        .unwrap_or(OPEN_BOXES_DEFAULT_LIMIT)
        .clamp(1, OPEN_BOXES_LIMIT_MAX)
}

/// Box row before memberships are attached.
struct BoxRow {
    seq: i64,
    drop_box: DropBox,
}

fn parse_box_row(row: &Row<'_>) -> RepoResult<BoxRow> {
    let id_text: String = row.get("id")?;
    let owner_text: String = row.get("owner")?;

    let closed = match row.get::<_, i64>("closed")? {
        0 => false,
        1 => true,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid closed value `{other}` in boxes.closed"
            )));
        }
    };

    let closed_reason = match row.get::<_, Option<String>>("closed_reason")? {
        Some(value) => Some(CloseReason::parse(&value).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid close reason `{value}` in boxes.closed_reason"
            ))
        })?),
        None => None,
    };

    let submission = match row.get::<_, Option<String>>("submission")? {
        Some(value) => Some(Submission::from_json(&value).map_err(|err| {
            RepoError::InvalidData(format!("invalid submission json in boxes.submission: {err}"))
        })?),
        None => None,
    };

    Ok(BoxRow {
        seq: row.get("seq")?,
        drop_box: DropBox {
            id: parse_uuid(&id_text, "boxes.id")?,
            owner: parse_uuid(&owner_text, "boxes.owner")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
            closed,
            closed_at: row.get("closed_at")?,
            closed_reason,
            submission,
            memberships: Vec::new(),
        },
    })
}

fn resolve_box(conn: &Connection, row: BoxRow) -> RepoResult<DropBox> {
    let mut drop_box = row.drop_box;
    drop_box.memberships = load_memberships(conn, drop_box.id)?;
    drop_box.validate()?;
    Ok(drop_box)
}

fn load_memberships(conn: &Connection, id: BoxId) -> RepoResult<Vec<Membership>> {
    let mut stmt = conn.prepare(
        "SELECT
            m.box_id AS box_id,
            m.principal AS principal,
            m.access AS access,
            m.created_at AS created_at
         FROM memberships m
         INNER JOIN boxes b ON b.id = m.box_id
         WHERE m.box_id = ?1
         ORDER BY (m.principal = b.owner) DESC, m.created_at ASC, m.principal ASC;",
    )?;

    let mut rows = stmt.query([id.to_string()])?;
    let mut memberships = Vec::new();
    while let Some(row) = rows.next()? {
        let box_text: String = row.get("box_id")?;
        let principal_text: String = row.get("principal")?;
        let access_text: String = row.get("access")?;
        let access = AccessLevel::parse(&access_text).map_err(|err| {
            RepoError::InvalidData(format!("{err} in memberships.access"))
        })?;

        memberships.push(Membership {
            box_id: parse_uuid(&box_text, "memberships.box_id")?,
            principal: parse_uuid(&principal_text, "memberships.principal")?,
            access,
            created_at: row.get("created_at")?,
        });
    }

    Ok(memberships)
}

fn upsert_membership(conn: &Connection, membership: &Membership) -> RepoResult<()> {
    conn.execute(
        "INSERT INTO memberships (box_id, principal, access, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (box_id, principal) DO UPDATE SET access = excluded.access;",
        params![
            membership.box_id.to_string(),
            membership.principal.to_string(),
            membership.access.as_str(),
            membership.created_at,
        ],
    )?;
    Ok(())
}

fn ensure_box_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["boxes", "memberships"] {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table],
            |row| row.get(0),
        )?;
        if exists != 1 {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }

    Ok(())
}

fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
