//! Tool execution error types.

use thiserror::Error;

use crate::outcome::{ErrorInfo, ErrorKind};

/// Errors that can occur during tool execution.
///
/// Tools return these; the registry folds them into an error [`Outcome`]
/// via [`ToolError::to_error_info`].
///
/// [`Outcome`]: crate::outcome::Outcome
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool not found in registry.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Tool execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Tool execution timed out.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote endpoint answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Fully classified failure supplied by the tool.
    #[error("{}", .0.message)]
    Classified(ErrorInfo),
}

impl ToolError {
    /// Map onto the error descriptor recorded in the outcome.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            ToolError::NotFound(_) => ErrorInfo::new(ErrorKind::NotFound, self.to_string()),
            ToolError::ExecutionFailed(_) | ToolError::Io(_) => {
                ErrorInfo::new(ErrorKind::Execution, self.to_string())
            }
            ToolError::Timeout(_) => ErrorInfo::new(ErrorKind::Timeout, self.to_string()),
            ToolError::Configuration(_) => {
                ErrorInfo::new(ErrorKind::Configuration, self.to_string())
            }
            ToolError::Http { status, message } => ErrorInfo::http(*status, message.clone()),
            ToolError::Connection(_) => ErrorInfo::new(ErrorKind::Connection, self.to_string()),
            ToolError::Json(_) => ErrorInfo::new(ErrorKind::Validation, self.to_string()),
            ToolError::Classified(info) => info.clone(),
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolError::NotFound("shell".to_string());
        assert_eq!(err.to_string(), "Tool not found: shell");

        let err = ToolError::Timeout(30);
        assert_eq!(err.to_string(), "Execution timed out after 30 seconds");

        let err = ToolError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 429: Too Many Requests");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let tool_err: ToolError = io_err.into();
        assert!(matches!(tool_err, ToolError::Io(_)));
    }

    #[test]
    fn test_error_info_mapping() {
        let info = ToolError::Http {
            status: 500,
            message: "boom".to_string(),
        }
        .to_error_info();
        assert_eq!(info.http_status(), Some(500));
        assert!(info.retryable);

        assert!(ToolError::Timeout(5).to_error_info().retryable);
        assert!(!ToolError::ExecutionFailed("x".into()).to_error_info().retryable);
        assert!(!ToolError::NotFound("x".into()).to_error_info().retryable);
    }
}
