//! Database module for the NoETL orchestrator.
//!
//! Connectivity, schema, models and queries for PostgreSQL using SQLx.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, health_check, DbPool};
pub use schema::init_schema;
