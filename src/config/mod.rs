use anyhow::Context;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    /// Reads configuration from the environment. `DATABASE_URL` is
    /// required; host and port fall back to local defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        Ok(Self {
            server: ServerConfig { host, port },
            database_url,
        })
    }
}
