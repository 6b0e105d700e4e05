//! Event model for execution event sourcing.
//!
//! All execution state is derived from events stored in the event table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Event types for workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    /// Execution submitted with its workload
    ExecutionStart,
    /// Orchestrator decided a node should run
    StepScheduled,
    /// Worker picked up a queue item
    StepStarted,
    /// Tool returned an `ok` outcome
    ActionCompleted,
    /// Tool returned an `error` outcome
    ActionFailed,
    /// Policy decided to retry the node
    StepRetry,
    /// Node finished successfully
    StepCompleted,
    /// Node failed terminally
    StepFailed,
    /// Iterator collection resolved and fanned out
    IteratorStarted,
    /// Playbook completed successfully
    PlaybookCompleted,
    /// Playbook failed
    PlaybookFailed,
    /// Custom event type (for extensibility)
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ExecutionStart => "execution_start",
            EventType::StepScheduled => "step_scheduled",
            EventType::StepStarted => "step_started",
            EventType::ActionCompleted => "action_completed",
            EventType::ActionFailed => "action_failed",
            EventType::StepRetry => "step_retry",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::IteratorStarted => "iterator_started",
            EventType::PlaybookCompleted => "playbook_completed",
            EventType::PlaybookFailed => "playbook_failed",
            EventType::Custom(s) => s,
        }
    }

    /// Whether appending this event ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::PlaybookCompleted | EventType::PlaybookFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "execution_start" => EventType::ExecutionStart,
            "step_scheduled" => EventType::StepScheduled,
            "step_started" => EventType::StepStarted,
            "action_completed" => EventType::ActionCompleted,
            "action_failed" => EventType::ActionFailed,
            "step_retry" => EventType::StepRetry,
            "step_completed" => EventType::StepCompleted,
            "step_failed" => EventType::StepFailed,
            "iterator_started" => EventType::IteratorStarted,
            "playbook_completed" => EventType::PlaybookCompleted,
            "playbook_failed" => EventType::PlaybookFailed,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        EventType::from(s.as_str())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

/// Event status values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Started => "STARTED",
            EventStatus::Running => "RUNNING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Retrying => "RETRYING",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for EventStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "STARTED" => EventStatus::Started,
            "RUNNING" => EventStatus::Running,
            "COMPLETED" => EventStatus::Completed,
            "FAILED" => EventStatus::Failed,
            "RETRYING" => EventStatus::Retrying,
            _ => EventStatus::Pending,
        }
    }
}

/// Immutable execution event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-execution sequence number, strictly increasing from 1.
    pub event_id: i64,
    pub execution_id: i64,
    /// Step name or iteration node id (`step[index]`).
    pub node_name: String,
    pub event_type: EventType,
    pub status: EventStatus,
    /// Payload: inputs, outputs, error descriptor, scope.
    pub context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Look up a context field.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.get(key)
    }

    /// `attempt` from the context, for worker-reported events.
    pub fn attempt(&self) -> Option<u32> {
        self.field("attempt")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
    }

    /// `queue_id` from the context, for worker-reported events.
    pub fn queue_id(&self) -> Option<i64> {
        self.field("queue_id").and_then(|v| v.as_i64())
    }
}

/// Database event record.
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub execution_id: i64,
    pub event_id: i64,
    pub node_name: String,
    pub event_type: String,
    pub status: String,
    pub context: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            execution_id: row.execution_id,
            node_name: row.node_name,
            event_type: EventType::from(row.event_type),
            status: EventStatus::from(row.status.as_str()),
            context: row.context,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        }
    }
}

/// Request to append a new event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub execution_id: i64,
    pub node_name: String,
    pub event_type: EventType,
    pub status: EventStatus,
    pub context: serde_json::Value,
    /// Appending a key that already exists for the execution is a no-op
    /// returning the existing event id.
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(
        execution_id: i64,
        node_name: impl Into<String>,
        event_type: EventType,
        status: EventStatus,
    ) -> Self {
        Self {
            execution_id,
            node_name: node_name.into(),
            event_type,
            status,
            context: serde_json::Value::Object(serde_json::Map::new()),
            idempotency_key: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Materialize as a stored event.
    pub fn into_event(self, event_id: i64, created_at: DateTime<Utc>) -> Event {
        Event {
            event_id,
            execution_id: self.execution_id,
            node_name: self.node_name,
            event_type: self.event_type,
            status: self.status,
            context: self.context,
            idempotency_key: self.idempotency_key,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::ExecutionStart.to_string(), "execution_start");
        assert_eq!(EventType::IteratorStarted.to_string(), "iterator_started");
        assert_eq!(EventType::PlaybookFailed.to_string(), "playbook_failed");
    }

    #[test]
    fn test_event_type_from_str() {
        assert_eq!(EventType::from("step_retry"), EventType::StepRetry);
        assert_eq!(
            EventType::from("custom_event"),
            EventType::Custom("custom_event".to_string())
        );
        assert!(EventType::PlaybookCompleted.is_terminal());
        assert!(!EventType::StepCompleted.is_terminal());
    }

    #[test]
    fn test_event_type_serializes_as_string() {
        let json = serde_json::to_value(EventType::ActionFailed).unwrap();
        assert_eq!(json, serde_json::json!("action_failed"));
        let custom: EventType = serde_json::from_value(serde_json::json!("audit")).unwrap();
        assert_eq!(custom, EventType::Custom("audit".to_string()));
    }

    #[test]
    fn test_event_status_from_str() {
        assert_eq!(EventStatus::from("started"), EventStatus::Started);
        assert_eq!(EventStatus::from("RETRYING"), EventStatus::Retrying);
        assert_eq!(EventStatus::from("unknown"), EventStatus::Pending);
        assert_eq!(EventStatus::Completed.to_string(), "COMPLETED");
    }

    #[test]
    fn test_new_event_builder() {
        let event = NewEvent::new(7, "fetch", EventType::StepRetry, EventStatus::Retrying)
            .with_context(serde_json::json!({"attempt": 2, "queue_id": 11}))
            .with_key("retry:fetch:2")
            .into_event(3, Utc::now());
        assert_eq!(event.attempt(), Some(2));
        assert_eq!(event.queue_id(), Some(11));
        assert_eq!(event.idempotency_key.as_deref(), Some("retry:fetch:2"));
    }
}
