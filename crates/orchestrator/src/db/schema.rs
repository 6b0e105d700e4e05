//! Schema bootstrap.
//!
//! `init_schema` is idempotent and safe to run on every start.

use crate::db::DbPool;
use crate::error::EngineResult;

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS noetl;

CREATE TABLE IF NOT EXISTS noetl.execution (
    execution_id        BIGSERIAL PRIMARY KEY,
    playbook_reference  TEXT        NOT NULL,
    workload            JSONB       NOT NULL DEFAULT '{}'::jsonb,
    status              TEXT        NOT NULL DEFAULT 'running',
    parent_execution_id BIGINT      REFERENCES noetl.execution (execution_id),
    last_event_id       BIGINT      NOT NULL DEFAULT 0,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT execution_status_check CHECK (status IN ('running', 'completed', 'failed'))
);

CREATE INDEX IF NOT EXISTS execution_running_idx
    ON noetl.execution (execution_id) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS noetl.event (
    execution_id    BIGINT      NOT NULL REFERENCES noetl.execution (execution_id),
    event_id        BIGINT      NOT NULL,
    node_name       TEXT        NOT NULL,
    event_type      TEXT        NOT NULL,
    status          TEXT        NOT NULL,
    context         JSONB       NOT NULL DEFAULT '{}'::jsonb,
    idempotency_key TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (execution_id, event_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS event_idempotency_key_idx
    ON noetl.event (execution_id, idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS noetl.queue (
    queue_id         BIGSERIAL PRIMARY KEY,
    execution_id     BIGINT      NOT NULL REFERENCES noetl.execution (execution_id),
    node_id          TEXT        NOT NULL,
    node_type        TEXT        NOT NULL,
    payload          JSONB       NOT NULL DEFAULT '{}'::jsonb,
    status           TEXT        NOT NULL DEFAULT 'queued',
    lease_owner      TEXT,
    lease_expires_at TIMESTAMPTZ,
    attempt_count    INTEGER     NOT NULL DEFAULT 0,
    available_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    result           JSONB,
    error            JSONB,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT queue_status_check CHECK (status IN ('queued', 'leased', 'completed', 'failed')),
    CONSTRAINT queue_node_type_check CHECK (node_type IN ('step', 'iteration'))
);

CREATE UNIQUE INDEX IF NOT EXISTS queue_active_node_idx
    ON noetl.queue (execution_id, node_id) WHERE status IN ('queued', 'leased');

CREATE INDEX IF NOT EXISTS queue_eligible_idx
    ON noetl.queue (available_at, queue_id) WHERE status = 'queued';

CREATE INDEX IF NOT EXISTS queue_lease_expiry_idx
    ON noetl.queue (lease_expires_at) WHERE status = 'leased';
"#;

/// Create the `noetl` schema and its tables if they do not exist.
pub async fn init_schema(pool: &DbPool) -> EngineResult<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    tracing::info!("Database schema initialized");
    Ok(())
}
