use crate::config::AppConfig;
use crate::shared::utils::DbPool;

/// Shared application state handed to every axum handler.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> Self {
        Self { conn, config }
    }
}
