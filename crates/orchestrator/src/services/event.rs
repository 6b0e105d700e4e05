//! Event log service.
//!
//! The log is append-only. Ids are assigned per execution at append time,
//! strictly increasing and gap-free, under a row lock on the execution so
//! concurrent appenders for one execution serialize.

use async_trait::async_trait;
use chrono::Utc;

use crate::db::models::{Event, EventType, Execution, ExecutionStatus, NewEvent, NewExecution};
use crate::db::queries::event as queries;
use crate::engine::ExecutionState;
use crate::error::{EngineError, EngineResult};

use super::store::PgStore;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// The event was stored under this id.
    Recorded(i64),
    /// An event with the same idempotency key already exists.
    Existing(i64),
}

impl Appended {
    pub fn event_id(&self) -> i64 {
        match self {
            Self::Recorded(id) | Self::Existing(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// Execution status implied by appending an event of this type.
pub(crate) fn terminal_status(event_type: &EventType) -> Option<ExecutionStatus> {
    match event_type {
        EventType::PlaybookCompleted => Some(ExecutionStatus::Completed),
        EventType::PlaybookFailed => Some(ExecutionStatus::Failed),
        _ => None,
    }
}

/// Durable per-execution event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create an execution in `running` status.
    async fn create_execution(&self, execution: &NewExecution) -> EngineResult<i64>;

    async fn get_execution(&self, execution_id: i64) -> EngineResult<Option<Execution>>;

    /// Ids of executions still running, oldest first.
    async fn running_executions(&self) -> EngineResult<Vec<i64>>;

    /// Durably append an event.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown execution, `StoreUnavailable` when the store
    /// cannot complete the write. Nothing is dropped silently.
    async fn append(&self, event: NewEvent) -> EngineResult<Appended>;

    /// Events with `event_id > after`, in id order.
    async fn read(&self, execution_id: i64, after: i64) -> EngineResult<Vec<Event>>;

    /// Fold every event of the execution into its current state.
    async fn replay(&self, execution_id: i64) -> EngineResult<ExecutionState> {
        let events = self.read(execution_id, 0).await?;
        ExecutionState::from_events(&events).ok_or_else(|| {
            EngineError::NotFound(format!("Execution {} has no events", execution_id))
        })
    }
}

#[async_trait]
impl EventLog for PgStore {
    async fn create_execution(&self, execution: &NewExecution) -> EngineResult<i64> {
        let execution_id = queries::insert_execution(&self.pool, execution).await?;
        tracing::debug!(
            execution_id,
            playbook = %execution.playbook_reference,
            "Execution created"
        );
        Ok(execution_id)
    }

    async fn get_execution(&self, execution_id: i64) -> EngineResult<Option<Execution>> {
        queries::get_execution(&self.pool, execution_id)
            .await?
            .map(Execution::try_from)
            .transpose()
    }

    async fn running_executions(&self) -> EngineResult<Vec<i64>> {
        queries::running_execution_ids(&self.pool).await
    }

    async fn append(&self, event: NewEvent) -> EngineResult<Appended> {
        let mut tx = self.pool.begin().await?;

        let last_event_id = queries::lock_execution(&mut *tx, event.execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("Execution {} not found", event.execution_id))
            })?;

        if let Some(key) = event.idempotency_key.as_deref() {
            if let Some(existing) =
                queries::find_event_id_by_key(&mut *tx, event.execution_id, key).await?
            {
                tx.rollback().await?;
                tracing::trace!(
                    execution_id = event.execution_id,
                    key = %key,
                    event_id = existing,
                    "Event already recorded"
                );
                return Ok(Appended::Existing(existing));
            }
        }

        let event_id = last_event_id + 1;
        queries::insert_event(&mut *tx, event_id, &event, Utc::now()).await?;
        queries::advance_execution(
            &mut *tx,
            event.execution_id,
            event_id,
            terminal_status(&event.event_type),
        )
        .await?;
        tx.commit().await?;

        tracing::debug!(
            execution_id = event.execution_id,
            event_id,
            event_type = %event.event_type,
            node_name = %event.node_name,
            "Event appended"
        );
        Ok(Appended::Recorded(event_id))
    }

    async fn read(&self, execution_id: i64, after: i64) -> EngineResult<Vec<Event>> {
        let rows = queries::list_events(&self.pool, execution_id, after).await?;
        Ok(rows.into_iter().map(Event::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appended_accessors() {
        assert_eq!(Appended::Recorded(4).event_id(), 4);
        assert!(Appended::Recorded(4).is_new());
        assert!(!Appended::Existing(2).is_new());
    }

    #[test]
    fn test_terminal_status() {
        assert_eq!(
            terminal_status(&EventType::PlaybookFailed),
            Some(ExecutionStatus::Failed)
        );
        assert_eq!(terminal_status(&EventType::StepFailed), None);
    }
}
