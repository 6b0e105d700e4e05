//! Error types for the NoETL orchestrator.
//!
//! The variants follow the failure taxonomy of the execution core. Every
//! variant has a stable [`kind`](EngineError::kind) tag that is recorded in
//! `step_failed` / `playbook_failed` event payloads.

use serde_json::json;
use thiserror::Error;

/// Orchestration-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed step, policy, or playbook. Surfaced before anything is scheduled.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A tool failure that the step policy may retry.
    #[error("Transient tool error: {0}")]
    TransientTool(String),

    /// A tool failure that ends the node (policy said fail, or retries are exhausted).
    #[error("Terminal tool error: {0}")]
    TerminalTool(String),

    /// A worker that no longer owns the lease tried to act on the item.
    #[error("Lease conflict: queue item {queue_id} is not leased by {worker_id}")]
    LeaseConflict { queue_id: i64, worker_id: String },

    /// An item for the node is already queued or leased.
    #[error("Duplicate enqueue: node {node_id} of execution {execution_id} is already active")]
    DuplicateEnqueue { execution_id: i64, node_id: String },

    /// The durable store could not complete the operation.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Stable snake_case tag for event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::TransientTool(_) => "transient_tool_error",
            EngineError::TerminalTool(_) => "terminal_tool_error",
            EngineError::LeaseConflict { .. } => "lease_conflict",
            EngineError::DuplicateEnqueue { .. } => "duplicate_enqueue",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::Template(_) => "template_error",
            EngineError::Serialization(_) => "serialization_error",
            EngineError::Parse(_) => "parse_error",
            EngineError::Config(_) => "config_error",
        }
    }

    /// Error descriptor recorded in failure events.
    pub fn descriptor(&self) -> serde_json::Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }

    /// Whether the error must abort the calling operation rather than be
    /// recorded against a single node.
    pub fn is_store_error(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".to_string()),
            other => EngineError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<minijinja::Error> for EngineError {
    fn from(err: minijinja::Error) -> Self {
        EngineError::Template(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = EngineError::Validation("step 'x' declares data".to_string());
        assert_eq!(err.to_string(), "Validation error: step 'x' declares data");
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_lease_conflict_message() {
        let err = EngineError::LeaseConflict {
            queue_id: 42,
            worker_id: "w-1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Lease conflict: queue item 42 is not leased by w-1"
        );
    }

    #[test]
    fn test_descriptor() {
        let err = EngineError::TerminalTool("HTTP 500".to_string());
        let descriptor = err.descriptor();
        assert_eq!(descriptor["kind"], "terminal_tool_error");
        assert_eq!(descriptor["message"], "Terminal tool error: HTTP 500");
    }

    #[test]
    fn test_sqlx_mapping() {
        let err: EngineError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_store_error());
        let err: EngineError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
