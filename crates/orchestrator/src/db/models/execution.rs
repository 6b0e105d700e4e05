//! Execution model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::EngineError;

/// Execution status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Parse(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// One run of a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: i64,
    pub playbook_reference: String,
    pub workload: serde_json::Value,
    pub status: ExecutionStatus,
    pub parent_execution_id: Option<i64>,
    /// Highest event id appended so far.
    pub last_event_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database execution record.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub execution_id: i64,
    pub playbook_reference: String,
    pub workload: serde_json::Value,
    pub status: String,
    pub parent_execution_id: Option<i64>,
    pub last_event_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = EngineError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            execution_id: row.execution_id,
            playbook_reference: row.playbook_reference,
            workload: row.workload,
            status: row.status.parse()?,
            parent_execution_id: row.parent_execution_id,
            last_event_id: row.last_event_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Request to create an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    pub playbook_reference: String,
    pub workload: serde_json::Value,
    #[serde(default)]
    pub parent_execution_id: Option<i64>,
}

impl NewExecution {
    pub fn new(playbook_reference: impl Into<String>, workload: serde_json::Value) -> Self {
        Self {
            playbook_reference: playbook_reference.into(),
            workload,
            parent_execution_id: None,
        }
    }

    pub fn with_parent(mut self, parent_execution_id: i64) -> Self {
        self.parent_execution_id = Some(parent_execution_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("failed".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Failed);
        assert!("paused".parse::<ExecutionStatus>().is_err());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let row = ExecutionRow {
            execution_id: 1,
            playbook_reference: "demo".to_string(),
            workload: serde_json::json!({}),
            status: "archived".to_string(),
            parent_execution_id: None,
            last_event_id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(Execution::try_from(row).is_err());
    }
}
