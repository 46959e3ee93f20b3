use axum::{response::IntoResponse, Json};

use super::store::StoreError;
use super::Ticket;

#[derive(Debug, thiserror::Error)]
pub enum TicketsError {
    #[error("the ticket was modified by someone else")]
    VersionConflict { latest: Box<Ticket> },
    #[error("this ticket no longer exists")]
    NotFound,
    #[error("the ticket is closed; reopen it before making changes")]
    TicketClosed,
    #[error("clients cannot change ticket status")]
    StatusForbidden,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for TicketsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Query(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for TicketsError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        match self {
            // The conflict response always carries the current truth so
            // the caller can choose: discard local edits and reload, or
            // reapply them against the attached snapshot. Silently
            // overwriting the other writer is not an option.
            Self::VersionConflict { latest } => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "the ticket was modified by someone else",
                    "hint": "reload the attached snapshot and reapply your changes, or discard them",
                    "latest": *latest,
                })),
            )
                .into_response(),
            Self::NotFound => error_response(StatusCode::NOT_FOUND, self.to_string()),
            Self::TicketClosed | Self::Validation(_) => {
                error_response(StatusCode::BAD_REQUEST, self.to_string())
            }
            Self::StatusForbidden | Self::Forbidden(_) => {
                error_response(StatusCode::FORBIDDEN, self.to_string())
            }
            Self::StoreUnavailable(_) => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            Self::Internal(_) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
    }
}

fn error_response(status: axum::http::StatusCode, message: String) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
