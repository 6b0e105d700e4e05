//! Lease-based work queue.
//!
//! `lease` is the only concurrency-control primitive: it reclaims expired
//! leases and claims the oldest eligible item in one atomic step, so an item
//! has at most one live lease holder at any instant. Workers may only move a
//! leased item to `completed` or `failed`; redelivery belongs to the queue
//! (reclaim) and the orchestrator (`requeue`).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::models::{Completion, EnqueueRequest, QueueItem, QueueStatus};
use crate::db::queries::queue as queries;
use crate::error::{EngineError, EngineResult};

use super::store::PgStore;

#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Queue a node.
    ///
    /// # Errors
    ///
    /// `DuplicateEnqueue` when an item for the same `(execution_id, node_id)`
    /// is still queued or leased.
    async fn enqueue(&self, request: &EnqueueRequest) -> EngineResult<i64>;

    /// Claim the oldest eligible item for `worker_id`, if any.
    async fn lease(&self, worker_id: &str, timeout: Duration) -> EngineResult<Option<QueueItem>>;

    /// Extend a live lease. Returns `false` when the lease expired or was
    /// reassigned.
    async fn heartbeat(&self, queue_id: i64, worker_id: &str, extension: Duration)
        -> EngineResult<bool>;

    /// Mark a leased item completed. Repeated reports are no-ops.
    ///
    /// # Errors
    ///
    /// `LeaseConflict` when `worker_id` is not the lease owner.
    async fn complete(&self, queue_id: i64, worker_id: &str, result: &Value)
        -> EngineResult<Completion>;

    /// Mark a leased item failed. Repeated reports are no-ops.
    async fn fail(&self, queue_id: i64, worker_id: &str, error: &Value) -> EngineResult<Completion>;

    /// Return an item for another attempt after `delay`.
    ///
    /// Applies only while the item is leased or failed and its attempt count
    /// still equals `expected_attempt`; returns whether it applied.
    async fn requeue(&self, queue_id: i64, expected_attempt: i32, delay: Duration)
        -> EngineResult<bool>;

    async fn get(&self, queue_id: i64) -> EngineResult<Option<QueueItem>>;
}

/// Decide how a completion report applies to an item.
pub(crate) fn check_completion(
    item: &QueueItem,
    worker_id: &str,
) -> EngineResult<Option<Completion>> {
    if item.status.is_terminal() {
        return Ok(Some(Completion::AlreadyTerminal));
    }
    if item.status != QueueStatus::Leased || item.lease_owner.as_deref() != Some(worker_id) {
        return Err(EngineError::LeaseConflict {
            queue_id: item.queue_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(None)
}

impl PgStore {
    async fn finish(
        &self,
        queue_id: i64,
        worker_id: &str,
        status: QueueStatus,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> EngineResult<Completion> {
        let mut tx = self.pool.begin().await?;
        let item: QueueItem = queries::get_item(&mut *tx, queue_id, true)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Queue item {} not found", queue_id)))?
            .try_into()?;

        if let Some(completion) = check_completion(&item, worker_id)? {
            tx.rollback().await?;
            return Ok(completion);
        }

        queries::finish_item(&mut *tx, queue_id, status, result, error).await?;
        tx.commit().await?;

        tracing::debug!(queue_id, worker_id = %worker_id, status = %status, "Queue item finished");
        Ok(Completion::Applied)
    }
}

#[async_trait]
impl QueueManager for PgStore {
    async fn enqueue(&self, request: &EnqueueRequest) -> EngineResult<i64> {
        let queue_id = queries::insert_item(&self.pool, request).await?;
        tracing::debug!(
            queue_id,
            execution_id = request.execution_id,
            node_id = %request.node_id,
            node_type = %request.node_type,
            "Node enqueued"
        );
        Ok(queue_id)
    }

    async fn lease(&self, worker_id: &str, timeout: Duration) -> EngineResult<Option<QueueItem>> {
        let mut tx = self.pool.begin().await?;

        let reclaimed = queries::reclaim_expired(&mut *tx).await?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "Reclaimed expired leases");
        }

        let row = queries::claim_next(&mut *tx, worker_id, timeout.as_secs_f64()).await?;
        tx.commit().await?;

        row.map(QueueItem::try_from).transpose()
    }

    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        extension: Duration,
    ) -> EngineResult<bool> {
        let rows =
            queries::extend_lease(&self.pool, queue_id, worker_id, extension.as_secs_f64()).await?;
        Ok(rows > 0)
    }

    async fn complete(
        &self,
        queue_id: i64,
        worker_id: &str,
        result: &Value,
    ) -> EngineResult<Completion> {
        self.finish(queue_id, worker_id, QueueStatus::Completed, Some(result), None)
            .await
    }

    async fn fail(&self, queue_id: i64, worker_id: &str, error: &Value) -> EngineResult<Completion> {
        self.finish(queue_id, worker_id, QueueStatus::Failed, None, Some(error))
            .await
    }

    async fn requeue(
        &self,
        queue_id: i64,
        expected_attempt: i32,
        delay: Duration,
    ) -> EngineResult<bool> {
        let rows =
            queries::requeue_item(&self.pool, queue_id, expected_attempt, delay.as_secs_f64())
                .await?;
        Ok(rows > 0)
    }

    async fn get(&self, queue_id: i64) -> EngineResult<Option<QueueItem>> {
        queries::get_item(&self.pool, queue_id, false)
            .await?
            .map(QueueItem::try_from)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NodeType;
    use chrono::Utc;

    fn item(status: QueueStatus, owner: Option<&str>) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            queue_id: 3,
            execution_id: 1,
            node_id: "fetch".to_string(),
            node_type: NodeType::Step,
            payload: Value::Null,
            status,
            lease_owner: owner.map(str::to_string),
            lease_expires_at: None,
            attempt_count: 0,
            available_at: now,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_check_completion() {
        assert!(matches!(
            check_completion(&item(QueueStatus::Leased, Some("w-1")), "w-1"),
            Ok(None)
        ));
        assert!(matches!(
            check_completion(&item(QueueStatus::Completed, Some("w-1")), "w-2"),
            Ok(Some(Completion::AlreadyTerminal))
        ));
        assert!(matches!(
            check_completion(&item(QueueStatus::Leased, Some("w-1")), "w-2"),
            Err(EngineError::LeaseConflict { queue_id: 3, .. })
        ));
        assert!(matches!(
            check_completion(&item(QueueStatus::Queued, None), "w-1"),
            Err(EngineError::LeaseConflict { .. })
        ));
    }
}
