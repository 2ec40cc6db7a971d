//! Site deployment control panel: HTTP API over the deploy-sync pipeline.

pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod ws;

pub use config::AppConfig;
pub use state::AppState;
