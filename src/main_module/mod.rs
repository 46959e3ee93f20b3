//! Server wiring split out of main.rs.

mod health;
mod server;

pub use health::health_check;
pub use server::run_axum_server;
