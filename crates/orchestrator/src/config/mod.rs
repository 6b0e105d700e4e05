//! Configuration loading from environment variables.
//!
//! Uses `envy` for typed parsing; `.env` files are honored by the binary via
//! `dotenvy` before these loaders run.

mod app;
mod database;

pub use app::OrchestratorConfig;
pub use database::DatabaseConfig;
