pub mod error;
pub mod lifecycle;
pub mod service;
pub mod store;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::enums::{ActorRole, TicketPriority, TicketStatus};
use crate::shared::schema::{ticket_categories, ticket_comments, tickets};
use crate::shared::state::AppState;

use error::TicketsError;
use lifecycle::TransitionError;
use service::{CommentOutcome, EditOutcome, TicketChanges};
use store::{PgTicketStore, TicketDraft, TicketStore, VersionToken};

/// A ticket snapshot as read from storage. `version` is the opaque
/// token callers must present on their next edit.
#[derive(Debug, Clone, Serialize, Queryable)]
pub struct Ticket {
    pub id: i32,
    pub company_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub category_id: Option<i32>,
    pub assignee_id: Option<Uuid>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: VersionToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Comments are append-only: no update or delete surface exists.
#[derive(Debug, Clone, Serialize, Queryable)]
pub struct TicketComment {
    pub id: i32,
    pub ticket_id: i32,
    pub author_role: ActorRole,
    pub author_id: Option<Uuid>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Queryable)]
pub struct TicketCategory {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub company_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<TicketPriority>,
    pub category_id: Option<i32>,
    pub assignee_id: Option<Uuid>,
}

/// Body of `PUT /api/tickets/:id`. The version token is mandatory: an
/// edit without the caller's last-known token cannot be checked for
/// staleness and is refused at the type level.
#[derive(Debug, Deserialize)]
pub struct UpdateTicketRequest {
    pub version: VersionToken,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TicketPriority>,
    pub category_id: Option<i32>,
    pub assignee_id: Option<Uuid>,
    pub status: Option<TicketStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct CommentResponse {
    pub comment: TicketComment,
    /// True when this comment was the first staff response and stamped
    /// the SLA clock.
    pub first_response_stamped: bool,
    /// The parent ticket's token after the append.
    pub ticket_version: VersionToken,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub company_id: Option<i32>,
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub assignee_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct TicketStats {
    pub total_tickets: i64,
    pub open_tickets: i64,
    pub in_progress_tickets: i64,
    pub waiting_tickets: i64,
    pub resolved_tickets: i64,
    pub closed_tickets: i64,
    pub avg_resolution_hours: f64,
}

/// Actor identity arrives from the authentication layer upstream as
/// headers. An absent or malformed role falls back to Client, the
/// least privileged role.
fn actor_role(headers: &HeaderMap) -> ActorRole {
    headers
        .get("x-actor-role")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn actor_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), TicketsError> {
    if req.title.trim().is_empty() {
        return Err(TicketsError::Validation("title must not be empty".to_string()));
    }

    let store = PgTicketStore::new(state.conn.clone());
    let draft = TicketDraft {
        company_id: req.company_id,
        title: req.title,
        description: req.description,
        priority: req.priority.unwrap_or_default(),
        category_id: req.category_id,
        assignee_id: req.assignee_id,
    };

    log::debug!("creating ticket for company {}", draft.company_id);

    let ticket = tokio::task::spawn_blocking(move || store.create(draft, Utc::now()))
        .await
        .map_err(|e| TicketsError::Internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(ticket)))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Ticket>, TicketsError> {
    let store = PgTicketStore::new(state.conn.clone());
    let ticket = tokio::task::spawn_blocking(move || store.read(id))
        .await
        .map_err(|e| TicketsError::Internal(e.to_string()))??;

    ticket.map(Json).ok_or(TicketsError::NotFound)
}

pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, TicketsError> {
    let role = actor_role(&headers);
    let store = PgTicketStore::new(state.conn.clone());

    let changes = TicketChanges {
        title: req.title,
        description: req.description,
        priority: req.priority,
        category_id: req.category_id,
        assignee_id: req.assignee_id,
    };
    let token = req.version;
    let requested_status = req.status;

    let outcome = tokio::task::spawn_blocking(move || {
        service::edit_ticket(&store, id, token, changes, requested_status, role, Utc::now())
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    match outcome {
        EditOutcome::Updated(ticket) => Ok(Json(ticket)),
        EditOutcome::Conflict(latest) => {
            log::info!("edit conflict on ticket {} (actor role {})", id, role);
            Err(TicketsError::VersionConflict {
                latest: Box::new(latest),
            })
        }
        EditOutcome::NotFound => Err(TicketsError::NotFound),
        EditOutcome::Rejected(TransitionError::RoleForbidden) => Err(TicketsError::StatusForbidden),
        EditOutcome::Rejected(TransitionError::TicketClosed) => Err(TicketsError::TicketClosed),
    }
}

pub async fn delete_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    headers: HeaderMap,
) -> Result<StatusCode, TicketsError> {
    if actor_role(&headers) != ActorRole::Admin {
        return Err(TicketsError::Forbidden(
            "only admins may delete tickets".to_string(),
        ));
    }

    let store = PgTicketStore::new(state.conn.clone());
    let deleted = tokio::task::spawn_blocking(move || store.delete(id))
        .await
        .map_err(|e| TicketsError::Internal(e.to_string()))??;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TicketsError::NotFound)
    }
}

pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<CommentResponse>), TicketsError> {
    if req.body.trim().is_empty() {
        return Err(TicketsError::Validation("comment must not be empty".to_string()));
    }

    let role = actor_role(&headers);
    let author = actor_id(&headers);
    let store = PgTicketStore::new(state.conn.clone());

    let outcome = tokio::task::spawn_blocking(move || {
        service::add_comment(&store, ticket_id, role, author, req.body, Utc::now())
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    match outcome {
        CommentOutcome::Added {
            comment,
            ticket,
            first_response_stamped,
        } => Ok((
            StatusCode::CREATED,
            Json(CommentResponse {
                comment,
                first_response_stamped,
                ticket_version: ticket.version,
            }),
        )),
        CommentOutcome::NotFound => Err(TicketsError::NotFound),
        CommentOutcome::TicketClosed => Err(TicketsError::TicketClosed),
    }
}

pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<i32>,
) -> Result<Json<Vec<TicketComment>>, TicketsError> {
    let pool = state.conn.clone();
    let comments = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| TicketsError::StoreUnavailable(e.to_string()))?;

        let exists = diesel::select(diesel::dsl::exists(tickets::table.find(ticket_id)))
            .get_result::<bool>(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))?;
        if !exists {
            return Err(TicketsError::NotFound);
        }

        ticket_comments::table
            .filter(ticket_comments::ticket_id.eq(ticket_id))
            .order(ticket_comments::created_at.asc())
            .load::<TicketComment>(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    Ok(Json(comments))
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Ticket>>, TicketsError> {
    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| TicketsError::StoreUnavailable(e.to_string()))?;

        let limit = query.limit.unwrap_or(50).clamp(1, 200);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut q = tickets::table.into_boxed();

        if let Some(company_id) = query.company_id {
            q = q.filter(tickets::company_id.eq(company_id));
        }
        if let Some(status) = query.status {
            q = q.filter(tickets::status.eq(status));
        }
        if let Some(priority) = query.priority {
            q = q.filter(tickets::priority.eq(priority));
        }
        if let Some(assignee_id) = query.assignee_id {
            q = q.filter(tickets::assignee_id.eq(assignee_id));
        }

        q.order(tickets::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load::<Ticket>(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn get_ticket_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TicketStats>, TicketsError> {
    let pool = state.conn.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| TicketsError::StoreUnavailable(e.to_string()))?;

        let count_by = |conn: &mut diesel::PgConnection,
                        status: TicketStatus|
         -> Result<i64, TicketsError> {
            tickets::table
                .filter(tickets::status.eq(status))
                .count()
                .get_result(conn)
                .map_err(|e| TicketsError::Internal(e.to_string()))
        };

        let total_tickets: i64 = tickets::table
            .count()
            .get_result(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))?;

        let open_tickets = count_by(&mut conn, TicketStatus::Open)?;
        let in_progress_tickets = count_by(&mut conn, TicketStatus::InProgress)?;
        let waiting_tickets = count_by(&mut conn, TicketStatus::Waiting)?;
        let resolved_tickets = count_by(&mut conn, TicketStatus::Resolved)?;
        let closed_tickets = count_by(&mut conn, TicketStatus::Closed)?;

        let resolution_pairs: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)> = tickets::table
            .filter(tickets::resolved_at.is_not_null())
            .select((tickets::created_at, tickets::resolved_at))
            .load(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))?;

        let avg_resolution_hours = if resolution_pairs.is_empty() {
            0.0
        } else {
            let total_hours: f64 = resolution_pairs
                .iter()
                .filter_map(|(created, resolved)| {
                    resolved.map(|r| (r - *created).num_seconds() as f64 / 3600.0)
                })
                .sum();
            total_hours / resolution_pairs.len() as f64
        };

        Ok::<TicketStats, TicketsError>(TicketStats {
            total_tickets,
            open_tickets,
            in_progress_tickets,
            waiting_tickets,
            resolved_tickets,
            closed_tickets,
            avg_resolution_hours,
        })
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    Ok(Json(stats))
}

pub async fn list_categories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TicketCategory>>, TicketsError> {
    let pool = state.conn.clone();
    let categories = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| TicketsError::StoreUnavailable(e.to_string()))?;
        ticket_categories::table
            .order(ticket_categories::name.asc())
            .load::<TicketCategory>(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    Ok(Json(categories))
}

pub async fn create_category(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<TicketCategory>), TicketsError> {
    if req.name.trim().is_empty() {
        return Err(TicketsError::Validation("name must not be empty".to_string()));
    }

    let pool = state.conn.clone();
    let category = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| TicketsError::StoreUnavailable(e.to_string()))?;
        diesel::insert_into(ticket_categories::table)
            .values((
                ticket_categories::name.eq(&req.name),
                ticket_categories::created_at.eq(Utc::now()),
            ))
            .get_result::<TicketCategory>(&mut conn)
            .map_err(|e| TicketsError::Internal(e.to_string()))
    })
    .await
    .map_err(|e| TicketsError::Internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(category)))
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route("/api/tickets/stats", get(get_ticket_stats))
        .route(
            "/api/tickets/categories",
            get(list_categories).post(create_category),
        )
        .route(
            "/api/tickets/:id",
            get(get_ticket).put(update_ticket).delete(delete_ticket),
        )
        .route(
            "/api/tickets/:id/comentarios",
            get(list_comments).post(add_comment),
        )
}
