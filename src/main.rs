use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;

use deskserver::config::AppConfig;
use deskserver::main_module::run_axum_server;
use deskserver::shared::state::AppState;
use deskserver::shared::utils::{create_conn, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;

    let pool = create_conn(&config.database_url)?;
    if let Err(e) = run_migrations(&pool) {
        error!("Migration failed: {}", e);
        return Err(anyhow::anyhow!("migration failed: {e}"));
    }

    info!("Starting deskserver {}", env!("CARGO_PKG_VERSION"));

    let state = Arc::new(AppState::new(pool, config.clone()));
    run_axum_server(state, &config.server).await?;

    Ok(())
}
