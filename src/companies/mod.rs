use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::shared::enums::ActorRole;
use crate::shared::schema::companies;
use crate::shared::state::AppState;

/// A tenant. Every ticket belongs to exactly one company.
#[derive(Debug, Clone, Serialize, Queryable)]
pub struct Company {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCompanyRequest {
    pub name: String,
}

fn actor_role(headers: &HeaderMap) -> ActorRole {
    headers
        .get("x-actor-role")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

pub async fn list_companies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Company>>, (StatusCode, String)> {
    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("DB error: {e}")))?;
        companies::table
            .order(companies::name.asc())
            .load::<Company>(&mut conn)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    Ok(Json(result))
}

pub async fn get_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Company>, (StatusCode, String)> {
    let pool = state.conn.clone();
    let company = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("DB error: {e}")))?;
        companies::table
            .find(id)
            .first::<Company>(&mut conn)
            .optional()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    company
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Company not found".to_string()))
}

pub async fn create_company(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateCompanyRequest>,
) -> Result<(StatusCode, Json<Company>), (StatusCode, String)> {
    if actor_role(&headers) != ActorRole::Admin {
        return Err((
            StatusCode::FORBIDDEN,
            "only admins may create companies".to_string(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name must not be empty".to_string()));
    }

    let pool = state.conn.clone();
    let company = tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("DB error: {e}")))?;
        diesel::insert_into(companies::table)
            .values((
                companies::name.eq(&req.name),
                companies::created_at.eq(Utc::now()),
            ))
            .get_result::<Company>(&mut conn)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    Ok((StatusCode::CREATED, Json(company)))
}

pub fn configure_companies_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/companies", get(list_companies).post(create_company))
        .route("/api/companies/:id", get(get_company))
}
