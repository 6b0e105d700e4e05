//! Queue database queries.
//!
//! Leasing is the only concurrency-control primitive: `claim_next` picks the
//! oldest eligible row with `FOR UPDATE SKIP LOCKED`, so two workers never
//! claim the same item.

use sqlx::postgres::PgExecutor;

use crate::db::models::{EnqueueRequest, QueueRow, QueueStatus};
use crate::error::{EngineError, EngineResult};

const QUEUE_COLUMNS: &str = "queue_id, execution_id, node_id, node_type, payload, status, \
     lease_owner, lease_expires_at, attempt_count, available_at, result, error, \
     created_at, updated_at";

/// Insert a queued item.
///
/// The partial unique index over active `(execution_id, node_id)` pairs turns
/// a second enqueue of an active node into `DuplicateEnqueue`.
pub async fn insert_item<'e, E: PgExecutor<'e>>(
    executor: E,
    request: &EnqueueRequest,
) -> EngineResult<i64> {
    let result: Result<(i64,), sqlx::Error> = sqlx::query_as(
        r#"
        INSERT INTO noetl.queue (execution_id, node_id, node_type, payload, status)
        VALUES ($1, $2, $3, $4, 'queued')
        RETURNING queue_id
        "#,
    )
    .bind(request.execution_id)
    .bind(&request.node_id)
    .bind(request.node_type.as_str())
    .bind(&request.payload)
    .fetch_one(executor)
    .await;

    match result {
        Ok(row) => Ok(row.0),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(EngineError::DuplicateEnqueue {
                execution_id: request.execution_id,
                node_id: request.node_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Return expired leases to the queue, counting the redelivery.
pub async fn reclaim_expired<'e, E: PgExecutor<'e>>(executor: E) -> EngineResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = 'queued',
            attempt_count = attempt_count + 1,
            lease_owner = NULL,
            lease_expires_at = NULL,
            available_at = now(),
            updated_at = now()
        WHERE status = 'leased' AND lease_expires_at < now()
        "#,
    )
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Claim the oldest eligible queued item.
pub async fn claim_next<'e, E: PgExecutor<'e>>(
    executor: E,
    worker_id: &str,
    timeout_secs: f64,
) -> EngineResult<Option<QueueRow>> {
    let sql = format!(
        r#"
        WITH next_item AS (
            SELECT queue_id
            FROM noetl.queue
            WHERE status = 'queued' AND available_at <= now()
            ORDER BY queue_id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE noetl.queue q
        SET status = 'leased',
            lease_owner = $1,
            lease_expires_at = now() + make_interval(secs => $2),
            updated_at = now()
        FROM next_item
        WHERE q.queue_id = next_item.queue_id
        RETURNING {}
        "#,
        QUEUE_COLUMNS
            .split(", ")
            .map(|c| format!("q.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let row = sqlx::query_as::<_, QueueRow>(&sql)
        .bind(worker_id)
        .bind(timeout_secs)
        .fetch_optional(executor)
        .await?;

    Ok(row)
}

/// Extend a live lease held by `worker_id`. Returns rows affected.
pub async fn extend_lease<'e, E: PgExecutor<'e>>(
    executor: E,
    queue_id: i64,
    worker_id: &str,
    extension_secs: f64,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.queue
        SET lease_expires_at = now() + make_interval(secs => $3),
            updated_at = now()
        WHERE queue_id = $1
          AND status = 'leased'
          AND lease_owner = $2
          AND lease_expires_at > now()
        "#,
    )
    .bind(queue_id)
    .bind(worker_id)
    .bind(extension_secs)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Load an item, optionally locking it for the rest of the transaction.
pub async fn get_item<'e, E: PgExecutor<'e>>(
    executor: E,
    queue_id: i64,
    for_update: bool,
) -> EngineResult<Option<QueueRow>> {
    let sql = format!(
        "SELECT {} FROM noetl.queue WHERE queue_id = $1{}",
        QUEUE_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );

    let row = sqlx::query_as::<_, QueueRow>(&sql)
        .bind(queue_id)
        .fetch_optional(executor)
        .await?;

    Ok(row)
}

/// Move a leased item to a terminal status.
pub async fn finish_item<'e, E: PgExecutor<'e>>(
    executor: E,
    queue_id: i64,
    status: QueueStatus,
    result: Option<&serde_json::Value>,
    error: Option<&serde_json::Value>,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = $2,
            result = $3,
            error = $4,
            lease_expires_at = NULL,
            updated_at = now()
        WHERE queue_id = $1
        "#,
    )
    .bind(queue_id)
    .bind(status.as_str())
    .bind(result)
    .bind(error)
    .execute(executor)
    .await?;

    Ok(())
}

/// Put a leased or failed item back in the queue for another attempt.
///
/// Applies only while `attempt_count` still equals `expected_attempt`.
pub async fn requeue_item<'e, E: PgExecutor<'e>>(
    executor: E,
    queue_id: i64,
    expected_attempt: i32,
    delay_secs: f64,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = 'queued',
            attempt_count = attempt_count + 1,
            lease_owner = NULL,
            lease_expires_at = NULL,
            available_at = now() + make_interval(secs => $3),
            updated_at = now()
        WHERE queue_id = $1
          AND attempt_count = $2
          AND status IN ('leased', 'failed')
        "#,
    )
    .bind(queue_id)
    .bind(expected_attempt)
    .bind(delay_secs)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
