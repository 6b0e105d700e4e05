//! Execution and event database queries.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;

use crate::db::models::{ExecutionRow, ExecutionStatus, NewEvent, NewExecution, EventRow};
use crate::error::EngineResult;

/// Insert a new execution row.
pub async fn insert_execution<'e, E: PgExecutor<'e>>(
    executor: E,
    execution: &NewExecution,
) -> EngineResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO noetl.execution (playbook_reference, workload, parent_execution_id, status)
        VALUES ($1, $2, $3, 'running')
        RETURNING execution_id
        "#,
    )
    .bind(&execution.playbook_reference)
    .bind(&execution.workload)
    .bind(execution.parent_execution_id)
    .fetch_one(executor)
    .await?;

    Ok(row.0)
}

/// Get an execution by id.
pub async fn get_execution<'e, E: PgExecutor<'e>>(
    executor: E,
    execution_id: i64,
) -> EngineResult<Option<ExecutionRow>> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT execution_id, playbook_reference, workload, status, parent_execution_id,
               last_event_id, created_at, updated_at
        FROM noetl.execution
        WHERE execution_id = $1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

/// Ids of executions that have not reached a terminal status.
pub async fn running_execution_ids<'e, E: PgExecutor<'e>>(executor: E) -> EngineResult<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT execution_id
        FROM noetl.execution
        WHERE status = 'running'
        ORDER BY execution_id ASC
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Lock the execution row and return its last event id.
///
/// Serializes appenders of the same execution until the transaction ends.
pub async fn lock_execution<'e, E: PgExecutor<'e>>(
    executor: E,
    execution_id: i64,
) -> EngineResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT last_event_id
        FROM noetl.execution
        WHERE execution_id = $1
        FOR UPDATE
        "#,
    )
    .bind(execution_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|r| r.0))
}

/// Find an event by idempotency key.
pub async fn find_event_id_by_key<'e, E: PgExecutor<'e>>(
    executor: E,
    execution_id: i64,
    key: &str,
) -> EngineResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT event_id
        FROM noetl.event
        WHERE execution_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(execution_id)
    .bind(key)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|r| r.0))
}

/// Insert an event with a pre-assigned id.
pub async fn insert_event<'e, E: PgExecutor<'e>>(
    executor: E,
    event_id: i64,
    event: &NewEvent,
    created_at: DateTime<Utc>,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.event (
            execution_id, event_id, node_name, event_type, status,
            context, idempotency_key, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.execution_id)
    .bind(event_id)
    .bind(&event.node_name)
    .bind(event.event_type.as_str())
    .bind(event.status.to_string())
    .bind(&event.context)
    .bind(event.idempotency_key.as_deref())
    .bind(created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Advance the execution's last event id and, for terminal events, its status.
///
/// A terminal status is never overwritten.
pub async fn advance_execution<'e, E: PgExecutor<'e>>(
    executor: E,
    execution_id: i64,
    last_event_id: i64,
    status: Option<ExecutionStatus>,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.execution
        SET last_event_id = $2,
            status = CASE WHEN status = 'running' AND $3::text IS NOT NULL THEN $3 ELSE status END,
            updated_at = now()
        WHERE execution_id = $1
        "#,
    )
    .bind(execution_id)
    .bind(last_event_id)
    .bind(status.map(|s| s.as_str()))
    .execute(executor)
    .await?;

    Ok(())
}

/// Events of an execution with `event_id > after`, in id order.
pub async fn list_events<'e, E: PgExecutor<'e>>(
    executor: E,
    execution_id: i64,
    after: i64,
) -> EngineResult<Vec<EventRow>> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT execution_id, event_id, node_name, event_type, status,
               context, idempotency_key, created_at
        FROM noetl.event
        WHERE execution_id = $1 AND event_id > $2
        ORDER BY event_id ASC
        "#,
    )
    .bind(execution_id)
    .bind(after)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}
