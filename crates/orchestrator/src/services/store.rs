//! Postgres-backed store for the event log and the queue.

use crate::db::{init_schema, DbPool};
use crate::error::EngineResult;

/// Event log and queue manager over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the tables and indexes if they are missing.
    pub async fn init(&self) -> EngineResult<()> {
        init_schema(&self.pool).await
    }
}
