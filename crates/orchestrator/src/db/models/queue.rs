//! Queue item model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::EngineError;

/// What a queue item schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A top-level task step.
    Step,
    /// One element of an iterator step.
    Iteration,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Iteration => "iteration",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(Self::Step),
            "iteration" => Ok(Self::Iteration),
            other => Err(EngineError::Parse(format!("unknown node type '{}'", other))),
        }
    }
}

/// Queue item status. `Completed` and `Failed` are terminal for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Parse(format!("unknown queue status '{}'", other))),
        }
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: i64,
    pub execution_id: i64,
    /// Step name, or `step[index]` for iteration items.
    pub node_id: String,
    pub node_type: NodeType,
    /// Rendered job: tool kind, config, args and context.
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Redeliveries so far (lease reclaims and policy retries).
    pub attempt_count: i32,
    /// Not eligible for lease before this instant.
    pub available_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// 1-based attempt number reported to tools and policies.
    pub fn attempt(&self) -> u32 {
        self.attempt_count.max(0) as u32 + 1
    }

    /// Whether `worker_id` holds a lease that has not expired at `now`.
    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Leased
            && self.lease_owner.as_deref() == Some(worker_id)
            && self.lease_expires_at.map(|t| t > now).unwrap_or(false)
    }
}

/// Database queue record.
#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub queue_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub node_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub available_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = EngineError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(Self {
            queue_id: row.queue_id,
            execution_id: row.execution_id,
            node_id: row.node_id,
            node_type: row.node_type.parse()?,
            payload: row.payload,
            status: row.status.parse()?,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            attempt_count: row.attempt_count,
            available_at: row.available_at,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Request to enqueue a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub execution_id: i64,
    pub node_id: String,
    pub node_type: NodeType,
    pub payload: serde_json::Value,
}

/// Result of `complete` / `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The item moved to its terminal state.
    Applied,
    /// The item was already terminal; the report is a no-op.
    AlreadyTerminal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item() -> QueueItem {
        let now = Utc::now();
        QueueItem {
            queue_id: 1,
            execution_id: 1,
            node_id: "fetch[0]".to_string(),
            node_type: NodeType::Iteration,
            payload: serde_json::json!({}),
            status: QueueStatus::Leased,
            lease_owner: Some("w-1".to_string()),
            lease_expires_at: Some(now + Duration::seconds(30)),
            attempt_count: 0,
            available_at: now,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_attempt_is_one_based() {
        let mut item = item();
        assert_eq!(item.attempt(), 1);
        item.attempt_count = 2;
        assert_eq!(item.attempt(), 3);
    }

    #[test]
    fn test_is_leased_by() {
        let item = item();
        let now = Utc::now();
        assert!(item.is_leased_by("w-1", now));
        assert!(!item.is_leased_by("w-2", now));
        assert!(!item.is_leased_by("w-1", now + Duration::seconds(60)));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("leased".parse::<QueueStatus>().unwrap(), QueueStatus::Leased);
        assert!("done".parse::<QueueStatus>().is_err());
        assert!(QueueStatus::Failed.is_terminal());
        assert_eq!("iteration".parse::<NodeType>().unwrap(), NodeType::Iteration);
    }
}
