//! Ticket mutation use cases.
//!
//! `edit_ticket` is the single write path for ticket fields and status:
//! read, consult the lifecycle rules, merge, compare-and-swap. A lost
//! race comes back as `Conflict` carrying the authoritative latest
//! snapshot; a deleted ticket comes back as `NotFound`. Neither is an
//! error, both are outcomes the caller must handle.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::shared::enums::{ActorRole, TicketPriority, TicketStatus};

use super::lifecycle::{self, TimestampEffect, TransitionEffects, TransitionError};
use super::store::{
    AppendOutcome, CasOutcome, CommentDraft, StoreError, TicketCandidate, TicketStore,
    VersionToken,
};
use super::{Ticket, TicketComment};

/// Field changes a caller may request; absent fields keep their value.
/// `None` means "leave as is" for every field, so a description cannot
/// be cleared back to null through this type, only replaced.
#[derive(Debug, Clone, Default)]
pub struct TicketChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TicketPriority>,
    pub category_id: Option<i32>,
    pub assignee_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum EditOutcome {
    Updated(Ticket),
    /// The caller's snapshot is stale; here is the current truth so
    /// they can decide whether to discard their edits or retry.
    Conflict(Ticket),
    NotFound,
    Rejected(TransitionError),
}

/// One edit attempt under optimistic concurrency.
///
/// The lifecycle rules are evaluated against the status the caller was
/// looking at: a stale token short-circuits into `Conflict` before any
/// policy decision, and a matching token proves the read status equals
/// the caller's view. The compare-and-swap can still lose to a racer
/// that commits between our read and the write; that also surfaces as
/// `Conflict`, with a fresh read attached.
pub fn edit_ticket(
    store: &dyn TicketStore,
    id: i32,
    token: VersionToken,
    changes: TicketChanges,
    requested_status: Option<TicketStatus>,
    actor: ActorRole,
    now: DateTime<Utc>,
) -> Result<EditOutcome, StoreError> {
    let Some(current) = store.read(id)? else {
        return Ok(EditOutcome::NotFound);
    };

    if current.version != token {
        return Ok(EditOutcome::Conflict(current));
    }

    let effects = match requested_status {
        Some(requested) => match lifecycle::transition(current.status, requested, actor) {
            Ok(effects) => effects,
            Err(reason) => return Ok(EditOutcome::Rejected(reason)),
        },
        None => TransitionEffects::unchanged(current.status),
    };

    // A closed ticket accepts nothing short of an explicit reopen.
    // Checked against the planned status, not the request shape: a
    // request re-asserting `Closed` is a no-op transition and must not
    // slip field edits (or a token bump) past the guard.
    if current.status == TicketStatus::Closed && effects.status != TicketStatus::Open {
        return Ok(EditOutcome::Rejected(TransitionError::TicketClosed));
    }

    let candidate = build_candidate(&current, changes, &effects, now);

    match store.compare_and_swap(id, token, candidate, now)? {
        CasOutcome::Applied(ticket) => Ok(EditOutcome::Updated(ticket)),
        CasOutcome::VersionMismatch => match store.read(id)? {
            Some(latest) => Ok(EditOutcome::Conflict(latest)),
            None => Ok(EditOutcome::NotFound),
        },
        CasOutcome::NotFound => Ok(EditOutcome::NotFound),
    }
}

fn build_candidate(
    current: &Ticket,
    changes: TicketChanges,
    effects: &TransitionEffects,
    now: DateTime<Utc>,
) -> TicketCandidate {
    let first_response_at = if effects.stamp_first_response {
        // Set-once: an earlier stamp (e.g. from a staff comment) wins.
        current.first_response_at.or(Some(now))
    } else {
        current.first_response_at
    };

    TicketCandidate {
        title: changes.title.unwrap_or_else(|| current.title.clone()),
        description: changes.description.or_else(|| current.description.clone()),
        status: effects.status,
        priority: changes.priority.unwrap_or(current.priority),
        category_id: changes.category_id.or(current.category_id),
        assignee_id: changes.assignee_id.or(current.assignee_id),
        first_response_at,
        resolved_at: apply_effect(effects.resolved_at, current.resolved_at, now),
        closed_at: apply_effect(effects.closed_at, current.closed_at, now),
    }
}

fn apply_effect(
    effect: TimestampEffect,
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match effect {
        TimestampEffect::Keep => current,
        TimestampEffect::Set => Some(now),
        TimestampEffect::Clear => None,
    }
}

#[derive(Debug)]
pub enum CommentOutcome {
    Added {
        comment: TicketComment,
        ticket: Ticket,
        first_response_stamped: bool,
    },
    NotFound,
    TicketClosed,
}

/// Appends a comment, tolerating the ticket having been deleted or
/// closed since the caller last looked at it.
pub fn add_comment(
    store: &dyn TicketStore,
    ticket_id: i32,
    author_role: ActorRole,
    author_id: Option<Uuid>,
    body: String,
    now: DateTime<Utc>,
) -> Result<CommentOutcome, StoreError> {
    let draft = CommentDraft {
        author_role,
        author_id,
        body,
    };

    match store.append_comment(ticket_id, draft, now)? {
        AppendOutcome::Appended {
            comment,
            ticket,
            first_response_stamped,
        } => Ok(CommentOutcome::Added {
            comment,
            ticket,
            first_response_stamped,
        }),
        AppendOutcome::NotFound => Ok(CommentOutcome::NotFound),
        AppendOutcome::TicketClosed => Ok(CommentOutcome::TicketClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::store::{MemoryTicketStore, TicketDraft};
    use chrono::Duration;

    fn seed(store: &MemoryTicketStore, now: DateTime<Utc>) -> Ticket {
        store
            .create(
                TicketDraft {
                    company_id: 1,
                    title: "vpn drops every hour".to_string(),
                    description: Some("started monday".to_string()),
                    priority: TicketPriority::Medium,
                    category_id: None,
                    assignee_id: None,
                },
                now,
            )
            .unwrap()
    }

    fn edit(
        store: &MemoryTicketStore,
        ticket: &Ticket,
        changes: TicketChanges,
        status: Option<TicketStatus>,
        actor: ActorRole,
        now: DateTime<Utc>,
    ) -> EditOutcome {
        edit_ticket(store, ticket.id, ticket.version, changes, status, actor, now).unwrap()
    }

    #[test]
    fn stale_token_gets_conflict_with_latest_snapshot() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let v1 = seed(&store, now);

        // User A: priority High, move to InProgress. Wins.
        let outcome = edit(
            &store,
            &v1,
            TicketChanges {
                priority: Some(TicketPriority::High),
                ..Default::default()
            },
            Some(TicketStatus::InProgress),
            ActorRole::Employee,
            now,
        );
        let v2 = match outcome {
            EditOutcome::Updated(t) => t,
            other => panic!("expected Updated, got {:?}", other),
        };
        assert_ne!(v2.version, v1.version);

        // User B still holds v1 and tries priority Low. Must lose and
        // be shown A's committed state, not overwrite it.
        let outcome = edit(
            &store,
            &v1,
            TicketChanges {
                priority: Some(TicketPriority::Low),
                ..Default::default()
            },
            None,
            ActorRole::Employee,
            now,
        );
        match outcome {
            EditOutcome::Conflict(latest) => {
                assert_eq!(latest.version, v2.version);
                assert_eq!(latest.priority, TicketPriority::High);
                assert_eq!(latest.status, TicketStatus::InProgress);
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn deleted_while_editing_is_not_found_not_conflict() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let ticket = seed(&store, now);
        store.delete(ticket.id).unwrap();

        let outcome = edit(
            &store,
            &ticket,
            TicketChanges {
                title: Some("new title".to_string()),
                ..Default::default()
            },
            None,
            ActorRole::Admin,
            now,
        );
        assert!(matches!(outcome, EditOutcome::NotFound));
    }

    #[test]
    fn closed_ticket_rejects_field_edits() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let ticket = seed(&store, now);

        let EditOutcome::Updated(closed) = edit(
            &store,
            &ticket,
            TicketChanges::default(),
            Some(TicketStatus::Closed),
            ActorRole::Admin,
            now,
        ) else {
            panic!("close failed");
        };

        let outcome = edit(
            &store,
            &closed,
            TicketChanges {
                title: Some("sneaky edit".to_string()),
                ..Default::default()
            },
            None,
            ActorRole::Employee,
            now,
        );
        assert!(matches!(
            outcome,
            EditOutcome::Rejected(TransitionError::TicketClosed)
        ));

        // Reopen is the sanctioned way back in.
        let outcome = edit(
            &store,
            &closed,
            TicketChanges::default(),
            Some(TicketStatus::Open),
            ActorRole::Admin,
            now,
        );
        let EditOutcome::Updated(reopened) = outcome else {
            panic!("reopen failed");
        };
        assert_eq!(reopened.status, TicketStatus::Open);
        assert_eq!(reopened.closed_at, None);
    }

    #[test]
    fn reasserting_closed_status_does_not_bypass_the_closed_guard() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let ticket = seed(&store, now);

        let EditOutcome::Updated(closed) = edit(
            &store,
            &ticket,
            TicketChanges::default(),
            Some(TicketStatus::Closed),
            ActorRole::Admin,
            now,
        ) else {
            panic!("close failed");
        };

        // Closed -> Closed is a no-op transition; it must not smuggle
        // field edits through, nor advance the token on its own.
        let outcome = edit(
            &store,
            &closed,
            TicketChanges {
                title: Some("sneaky edit".to_string()),
                ..Default::default()
            },
            Some(TicketStatus::Closed),
            ActorRole::Employee,
            now,
        );
        assert!(matches!(
            outcome,
            EditOutcome::Rejected(TransitionError::TicketClosed)
        ));

        let after = store.read(ticket.id).unwrap().unwrap();
        assert_eq!(after.version, closed.version);
        assert_eq!(after.title, closed.title);
    }

    #[test]
    fn client_status_change_is_rejected_before_any_write() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let ticket = seed(&store, now);

        let outcome = edit(
            &store,
            &ticket,
            TicketChanges::default(),
            Some(TicketStatus::Resolved),
            ActorRole::Client,
            now,
        );
        assert!(matches!(
            outcome,
            EditOutcome::Rejected(TransitionError::RoleForbidden)
        ));

        // Nothing moved: same token still wins.
        let after = store.read(ticket.id).unwrap().unwrap();
        assert_eq!(after.version, ticket.version);
    }

    #[test]
    fn resolution_round_trip_produces_a_fresh_timestamp() {
        let store = MemoryTicketStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let t2 = t0 + Duration::seconds(90);
        let ticket = seed(&store, t0);

        let EditOutcome::Updated(resolved) = edit(
            &store,
            &ticket,
            TicketChanges::default(),
            Some(TicketStatus::Resolved),
            ActorRole::Employee,
            t0,
        ) else {
            panic!("resolve failed");
        };
        assert_eq!(resolved.resolved_at, Some(t0));

        let EditOutcome::Updated(reopened) = edit(
            &store,
            &resolved,
            TicketChanges::default(),
            Some(TicketStatus::InProgress),
            ActorRole::Admin,
            t1,
        ) else {
            panic!("regress failed");
        };
        assert_eq!(reopened.resolved_at, None);

        let EditOutcome::Updated(resolved_again) = edit(
            &store,
            &reopened,
            TicketChanges::default(),
            Some(TicketStatus::Resolved),
            ActorRole::Employee,
            t2,
        ) else {
            panic!("re-resolve failed");
        };
        assert_eq!(resolved_again.resolved_at, Some(t2));
        assert!(resolved_again.resolved_at > resolved.resolved_at);
    }

    #[test]
    fn first_response_keeps_the_earliest_qualifying_event() {
        let store = MemoryTicketStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(15);
        let ticket = seed(&store, t0);

        // A staff comment stamps first.
        let CommentOutcome::Added { ticket: stamped, .. } = add_comment(
            &store,
            ticket.id,
            ActorRole::Employee,
            None,
            "on it".to_string(),
            t0,
        )
        .unwrap() else {
            panic!("comment failed");
        };
        assert_eq!(stamped.first_response_at, Some(t0));

        // The later status change away from Open must not move it.
        let EditOutcome::Updated(moved) = edit(
            &store,
            &stamped,
            TicketChanges::default(),
            Some(TicketStatus::InProgress),
            ActorRole::Employee,
            t1,
        ) else {
            panic!("transition failed");
        };
        assert_eq!(moved.first_response_at, Some(t0));
    }

    #[test]
    fn status_change_stamps_first_response_when_no_comment_did() {
        let store = MemoryTicketStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(15);
        let ticket = seed(&store, t0);

        let EditOutcome::Updated(moved) = edit(
            &store,
            &ticket,
            TicketChanges::default(),
            Some(TicketStatus::InProgress),
            ActorRole::Employee,
            t1,
        ) else {
            panic!("transition failed");
        };
        assert_eq!(moved.first_response_at, Some(t1));
    }

    #[test]
    fn comment_on_deleted_ticket_is_not_found() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let ticket = seed(&store, now);
        store.delete(ticket.id).unwrap();

        let outcome = add_comment(
            &store,
            ticket.id,
            ActorRole::Client,
            None,
            "anyone there?".to_string(),
            now,
        )
        .unwrap();
        assert!(matches!(outcome, CommentOutcome::NotFound));
    }

    #[test]
    fn noop_status_request_still_applies_field_changes() {
        let store = MemoryTicketStore::new();
        let now = Utc::now();
        let ticket = seed(&store, now);

        let outcome = edit(
            &store,
            &ticket,
            TicketChanges {
                title: Some("vpn drops every 55 minutes".to_string()),
                ..Default::default()
            },
            Some(TicketStatus::Open),
            ActorRole::Employee,
            now,
        );
        let EditOutcome::Updated(updated) = outcome else {
            panic!("expected Updated");
        };
        assert_eq!(updated.title, "vpn drops every 55 minutes");
        assert_eq!(updated.status, TicketStatus::Open);
        assert_eq!(updated.first_response_at, None);
    }
}
