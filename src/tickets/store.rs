//! Versioned ticket storage.
//!
//! Every ticket row carries a `row_version` token that advances by one
//! on every successful write and never otherwise. Updates go through
//! [`TicketStore::compare_and_swap`], which applies the write only when
//! the caller still holds the current token; the guard is a single
//! conditional `UPDATE`, so two racers with the same token can never
//! both win. Comment appends bump the parent ticket's token inside the
//! same transaction as the insert and the first-response stamp.

use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::BigInt;
use diesel::{AsExpression, FromSqlRow};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::shared::enums::{ActorRole, TicketPriority, TicketStatus};
use crate::shared::schema::{ticket_comments, tickets};
use crate::shared::utils::DbPool;

use super::{Ticket, TicketComment};

/// Opaque version token attached to every ticket snapshot.
///
/// Callers round-trip it verbatim; only the store interprets it. It is
/// serialized as a string so nothing outside this module is tempted to
/// do arithmetic on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow)]
#[diesel(sql_type = BigInt)]
pub struct VersionToken(i64);

impl VersionToken {
    /// Token assigned to a freshly created ticket.
    pub fn initial() -> Self {
        Self(1)
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for VersionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for VersionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<i64>()
            .map(Self)
            .map_err(|_| D::Error::custom("malformed version token"))
    }
}

impl ToSql<BigInt, Pg> for VersionToken {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <i64 as ToSql<BigInt, Pg>>::to_sql(&self.0, &mut out.reborrow())
    }
}

impl FromSql<BigInt, Pg> for VersionToken {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        i64::from_sql(bytes).map(Self)
    }
}

/// Infrastructure failure talking to the store. Conflicts and missing
/// rows are not errors; they come back as [`CasOutcome`] /
/// [`AppendOutcome`] variants.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// Fields of a new ticket at creation time. Status is always `Open`.
#[derive(Debug, Clone)]
pub struct TicketDraft {
    pub company_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub priority: TicketPriority,
    pub category_id: Option<i32>,
    pub assignee_id: Option<Uuid>,
}

/// The full mutable field set of a ticket, as it should read after a
/// successful compare-and-swap. `updated_at` and the new token are
/// supplied by the store itself, never by the caller.
#[derive(Debug, Clone)]
pub struct TicketCandidate {
    pub title: String,
    pub description: Option<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub category_id: Option<i32>,
    pub assignee_id: Option<Uuid>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum CasOutcome {
    /// The write applied; here is the committed row with its new token.
    Applied(Ticket),
    /// Someone else committed first. The caller must re-read.
    VersionMismatch,
    /// The ticket was deleted (or never existed). Not a conflict.
    NotFound,
}

#[derive(Debug, Clone)]
pub struct CommentDraft {
    pub author_role: ActorRole,
    pub author_id: Option<Uuid>,
    pub body: String,
}

#[derive(Debug)]
pub enum AppendOutcome {
    Appended {
        comment: TicketComment,
        /// The ticket after the append bumped its token.
        ticket: Ticket,
        first_response_stamped: bool,
    },
    NotFound,
    TicketClosed,
}

/// Storage contract for the ticket aggregate.
///
/// Implemented for Postgres and for an in-process map; the mutation
/// service is written against this trait so its race behavior can be
/// exercised with plain threads.
pub trait TicketStore: Send + Sync {
    fn create(&self, draft: TicketDraft, now: DateTime<Utc>) -> Result<Ticket, StoreError>;

    fn read(&self, id: i32) -> Result<Option<Ticket>, StoreError>;

    /// Applies `candidate` only if the stored token still equals
    /// `expected`. Atomic with respect to any concurrent call on the
    /// same id: exactly one of two racers with the same token wins.
    fn compare_and_swap(
        &self,
        id: i32,
        expected: VersionToken,
        candidate: TicketCandidate,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    /// Appends a comment, re-checking at append time that the ticket
    /// still exists and is not closed. A staff comment stamps
    /// `first_response_at` if unset, in the same atomic step.
    fn append_comment(
        &self,
        ticket_id: i32,
        draft: CommentDraft,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Hard delete. Returns false when the ticket was already gone.
    fn delete(&self, id: i32) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgTicketStore {
    pool: DbPool,
}

impl PgTicketStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>, StoreError>
    {
        self.pool
            .get()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl TicketStore for PgTicketStore {
    fn create(&self, draft: TicketDraft, now: DateTime<Utc>) -> Result<Ticket, StoreError> {
        let mut conn = self.conn()?;
        diesel::insert_into(tickets::table)
            .values((
                tickets::company_id.eq(draft.company_id),
                tickets::title.eq(draft.title),
                tickets::description.eq(draft.description),
                tickets::status.eq(TicketStatus::Open),
                tickets::priority.eq(draft.priority),
                tickets::category_id.eq(draft.category_id),
                tickets::assignee_id.eq(draft.assignee_id),
                tickets::row_version.eq(VersionToken::initial()),
                tickets::created_at.eq(now),
                tickets::updated_at.eq(now),
            ))
            .get_result::<Ticket>(&mut conn)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn read(&self, id: i32) -> Result<Option<Ticket>, StoreError> {
        let mut conn = self.conn()?;
        tickets::table
            .find(id)
            .first::<Ticket>(&mut conn)
            .optional()
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn compare_and_swap(
        &self,
        id: i32,
        expected: VersionToken,
        candidate: TicketCandidate,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn()?;

        // The version guard in the WHERE clause makes this a single
        // atomic step: of two racers holding the same token, only one
        // UPDATE matches a row.
        let updated = diesel::update(
            tickets::table
                .filter(tickets::id.eq(id))
                .filter(tickets::row_version.eq(expected)),
        )
        .set((
            tickets::title.eq(candidate.title),
            tickets::description.eq(candidate.description),
            tickets::status.eq(candidate.status),
            tickets::priority.eq(candidate.priority),
            tickets::category_id.eq(candidate.category_id),
            tickets::assignee_id.eq(candidate.assignee_id),
            tickets::first_response_at.eq(candidate.first_response_at),
            tickets::resolved_at.eq(candidate.resolved_at),
            tickets::closed_at.eq(candidate.closed_at),
            tickets::row_version.eq(expected.next()),
            tickets::updated_at.eq(now),
        ))
        .get_result::<Ticket>(&mut conn)
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if let Some(ticket) = updated {
            return Ok(CasOutcome::Applied(ticket));
        }

        // Nothing matched: stale token or deleted row. Callers must be
        // told which, so check whether the row still exists.
        let exists = diesel::select(diesel::dsl::exists(tickets::table.find(id)))
            .get_result::<bool>(&mut conn)
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if exists {
            Ok(CasOutcome::VersionMismatch)
        } else {
            Ok(CasOutcome::NotFound)
        }
    }

    fn append_comment(
        &self,
        ticket_id: i32,
        draft: CommentDraft,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut conn = self.conn()?;

        conn.transaction::<AppendOutcome, diesel::result::Error, _>(|conn| {
            // Row lock so the closed check, the insert and the
            // first-response stamp are one indivisible step.
            let ticket = tickets::table
                .find(ticket_id)
                .for_update()
                .first::<Ticket>(conn)
                .optional()?;

            let Some(ticket) = ticket else {
                return Ok(AppendOutcome::NotFound);
            };

            if ticket.status == TicketStatus::Closed {
                return Ok(AppendOutcome::TicketClosed);
            }

            let comment = diesel::insert_into(ticket_comments::table)
                .values((
                    ticket_comments::ticket_id.eq(ticket_id),
                    ticket_comments::author_role.eq(draft.author_role),
                    ticket_comments::author_id.eq(draft.author_id),
                    ticket_comments::body.eq(draft.body.clone()),
                    ticket_comments::created_at.eq(now),
                ))
                .get_result::<TicketComment>(conn)?;

            let stamp = draft.author_role.is_staff() && ticket.first_response_at.is_none();

            let ticket = if stamp {
                diesel::update(tickets::table.find(ticket_id))
                    .set((
                        tickets::first_response_at.eq(Some(now)),
                        tickets::updated_at.eq(now),
                        tickets::row_version.eq(tickets::row_version + 1i64),
                    ))
                    .get_result::<Ticket>(conn)?
            } else {
                diesel::update(tickets::table.find(ticket_id))
                    .set((
                        tickets::updated_at.eq(now),
                        tickets::row_version.eq(tickets::row_version + 1i64),
                    ))
                    .get_result::<Ticket>(conn)?
            };

            Ok(AppendOutcome::Appended {
                comment,
                ticket,
                first_response_stamped: stamp,
            })
        })
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn delete(&self, id: i32) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let deleted = diesel::delete(tickets::table.find(id))
            .execute(&mut conn)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    next_ticket_id: i32,
    next_comment_id: i32,
    tickets: HashMap<i32, Ticket>,
    comments: HashMap<i32, Vec<TicketComment>>,
}

/// Mutex-guarded map with the same compare-and-swap semantics as the
/// Postgres store. Used by the concurrency tests.
#[derive(Default)]
pub struct MemoryTicketStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store state poisoned".to_string()))
    }
}

impl TicketStore for MemoryTicketStore {
    fn create(&self, draft: TicketDraft, now: DateTime<Utc>) -> Result<Ticket, StoreError> {
        let mut inner = self.lock()?;
        inner.next_ticket_id += 1;
        let ticket = Ticket {
            id: inner.next_ticket_id,
            company_id: draft.company_id,
            title: draft.title,
            description: draft.description,
            status: TicketStatus::Open,
            priority: draft.priority,
            category_id: draft.category_id,
            assignee_id: draft.assignee_id,
            first_response_at: None,
            resolved_at: None,
            closed_at: None,
            version: VersionToken::initial(),
            created_at: now,
            updated_at: now,
        };
        inner.tickets.insert(ticket.id, ticket.clone());
        Ok(ticket)
    }

    fn read(&self, id: i32) -> Result<Option<Ticket>, StoreError> {
        Ok(self.lock()?.tickets.get(&id).cloned())
    }

    fn compare_and_swap(
        &self,
        id: i32,
        expected: VersionToken,
        candidate: TicketCandidate,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.lock()?;
        let Some(ticket) = inner.tickets.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };

        if ticket.version != expected {
            return Ok(CasOutcome::VersionMismatch);
        }

        ticket.title = candidate.title;
        ticket.description = candidate.description;
        ticket.status = candidate.status;
        ticket.priority = candidate.priority;
        ticket.category_id = candidate.category_id;
        ticket.assignee_id = candidate.assignee_id;
        ticket.first_response_at = candidate.first_response_at;
        ticket.resolved_at = candidate.resolved_at;
        ticket.closed_at = candidate.closed_at;
        ticket.version = expected.next();
        ticket.updated_at = now;

        Ok(CasOutcome::Applied(ticket.clone()))
    }

    fn append_comment(
        &self,
        ticket_id: i32,
        draft: CommentDraft,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.lock()?;
        inner.next_comment_id += 1;
        let comment_id = inner.next_comment_id;

        let Some(ticket) = inner.tickets.get_mut(&ticket_id) else {
            return Ok(AppendOutcome::NotFound);
        };

        if ticket.status == TicketStatus::Closed {
            return Ok(AppendOutcome::TicketClosed);
        }

        let comment = TicketComment {
            id: comment_id,
            ticket_id,
            author_role: draft.author_role,
            author_id: draft.author_id,
            body: draft.body,
            created_at: now,
        };

        let stamp = draft.author_role.is_staff() && ticket.first_response_at.is_none();
        if stamp {
            ticket.first_response_at = Some(now);
        }
        ticket.updated_at = now;
        ticket.version = ticket.version.next();
        let ticket = ticket.clone();

        inner
            .comments
            .entry(ticket_id)
            .or_default()
            .push(comment.clone());

        Ok(AppendOutcome::Appended {
            comment,
            ticket,
            first_response_stamped: stamp,
        })
    }

    fn delete(&self, id: i32) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        inner.comments.remove(&id);
        Ok(inner.tickets.remove(&id).is_some())
    }
}
