//! Ticket lifecycle state machine.
//!
//! All transition legality and the derived SLA timestamp effects live
//! here, in one table, instead of being scattered across handlers.
//! The function is pure: it never touches storage, so the rules can be
//! tested in isolation.

use crate::shared::enums::{ActorRole, TicketStatus};

/// Why a requested transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// Clients never drive ticket status; they only add comments.
    RoleForbidden,
    /// The ticket is closed. The only way out is an explicit staff
    /// reopen back to `Open`.
    TicketClosed,
}

/// What a legal transition does to a derived timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampEffect {
    Keep,
    Set,
    Clear,
}

/// The planned outcome of a legal transition. A request for the
/// current status is a no-op: the effects leave everything untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEffects {
    pub status: TicketStatus,
    /// Stamp `first_response_at` if it is still unset.
    pub stamp_first_response: bool,
    pub resolved_at: TimestampEffect,
    pub closed_at: TimestampEffect,
}

impl TransitionEffects {
    pub fn unchanged(status: TicketStatus) -> Self {
        Self {
            status,
            stamp_first_response: false,
            resolved_at: TimestampEffect::Keep,
            closed_at: TimestampEffect::Keep,
        }
    }
}

/// Decides whether `actor` may move a ticket from `current` to
/// `requested`, and which timestamp effects the move carries.
///
/// Staff may move freely among the non-closed states, forward or
/// backward. Entering `Resolved` stamps the resolution clock; moving
/// back out of `Resolved`/`Closed` clears it, so a later resolution
/// gets a fresh timestamp. The first move away from `Open` stamps the
/// first-response clock if no staff comment stamped it earlier.
pub fn transition(
    current: TicketStatus,
    requested: TicketStatus,
    actor: ActorRole,
) -> Result<TransitionEffects, TransitionError> {
    if requested == current {
        return Ok(TransitionEffects::unchanged(current));
    }

    if !actor.is_staff() {
        return Err(TransitionError::RoleForbidden);
    }

    if current == TicketStatus::Closed && requested != TicketStatus::Open {
        return Err(TransitionError::TicketClosed);
    }

    let mut effects = TransitionEffects::unchanged(requested);

    if current == TicketStatus::Open {
        effects.stamp_first_response = true;
    }

    match requested {
        TicketStatus::Resolved => {
            effects.resolved_at = TimestampEffect::Set;
        }
        TicketStatus::Closed => {
            effects.closed_at = TimestampEffect::Set;
        }
        TicketStatus::Open | TicketStatus::InProgress | TicketStatus::Waiting => {
            if matches!(current, TicketStatus::Resolved | TicketStatus::Closed) {
                effects.resolved_at = TimestampEffect::Clear;
                effects.closed_at = TimestampEffect::Clear;
            }
        }
    }

    Ok(effects)
}
