//! Task outcome shape.
//!
//! An [`Outcome`] is what a tool invocation produces and what retry policies
//! are evaluated against. It serializes to the structure exposed to policy
//! expressions as `outcome`:
//!
//! ```json
//! {
//!   "status": "error",
//!   "error": {"kind": "rate_limit", "message": "...", "retryable": true,
//!             "code": "HTTP_429", "http": {"status": 429}},
//!   "meta": {"attempt": 1, "duration_ms": 12, "tool": "http"}
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Status of a task outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Error,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Standardized error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    RateLimit,
    Auth,
    NotFound,
    ClientError,
    ServerError,
    Configuration,
    Validation,
    Execution,
    Unknown,
}

impl ErrorKind {
    /// Classify an HTTP status code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            401 | 403 => Self::Auth,
            404 => Self::NotFound,
            408 => Self::Timeout,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Whether errors of this kind are transient by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::RateLimit | Self::ServerError
        )
    }
}

/// HTTP diagnostics attached to an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpInfo {
    pub status: u16,
}

/// Error descriptor carried by an `error` outcome.
///
/// `retryable` is inferred from the kind (and HTTP status) unless a tool sets
/// it explicitly with [`ErrorInfo::with_retryable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawErrorInfo")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpInfo>,
}

#[derive(Deserialize)]
struct RawErrorInfo {
    #[serde(default = "unknown_kind")]
    kind: ErrorKind,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retryable: Option<bool>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    http: Option<HttpInfo>,
}

fn unknown_kind() -> ErrorKind {
    ErrorKind::Unknown
}

impl From<RawErrorInfo> for ErrorInfo {
    fn from(raw: RawErrorInfo) -> Self {
        let inferred = match &raw.http {
            Some(http) => is_transient_http_status(http.status),
            None => raw.kind.is_transient(),
        };
        Self {
            kind: raw.kind,
            message: raw.message,
            retryable: raw.retryable.unwrap_or(inferred),
            code: raw.code,
            http: raw.http,
        }
    }
}

/// 429 and every 5xx are treated as transient.
pub fn is_transient_http_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

impl ErrorInfo {
    /// Create an error descriptor, inferring `retryable` from the kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
            code: None,
            http: None,
        }
    }

    /// Create an error descriptor for an HTTP response status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_http_status(status),
            message: message.into(),
            retryable: is_transient_http_status(status),
            code: Some(format!("HTTP_{}", status)),
            http: Some(HttpInfo { status }),
        }
    }

    /// Override the inferred retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http.as_ref().map(|h| h.status)
    }
}

/// Invocation metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeMeta {
    /// 1-based attempt number.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// Result of a single tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub meta: OutcomeMeta,
}

impl Outcome {
    /// Create a successful outcome.
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            status: OutcomeStatus::Ok,
            result: Some(result),
            error: None,
            meta: OutcomeMeta::default(),
        }
    }

    /// Create an error outcome.
    pub fn error(error: ErrorInfo) -> Self {
        Self {
            status: OutcomeStatus::Error,
            result: None,
            error: Some(error),
            meta: OutcomeMeta::default(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == OutcomeStatus::Error
    }

    /// Whether the error (if any) is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().map(|e| e.retryable).unwrap_or(false)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.meta.attempt = attempt;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.meta.duration_ms = duration_ms;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.meta.tool = Some(tool.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_classification() {
        let err = ErrorInfo::http(429, "slow down");
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert!(err.retryable);
        assert_eq!(err.code.as_deref(), Some("HTTP_429"));

        let err = ErrorInfo::http(503, "unavailable");
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert!(err.retryable);

        let err = ErrorInfo::http(404, "missing");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.retryable);
    }

    #[test]
    fn test_explicit_retryable_wins() {
        let err = ErrorInfo::http(500, "boom").with_retryable(false);
        assert!(!err.retryable);
    }

    #[test]
    fn test_deserialize_infers_retryable() {
        let err: ErrorInfo = serde_json::from_value(serde_json::json!({
            "kind": "server_error",
            "message": "bad gateway",
            "http": {"status": 502}
        }))
        .unwrap();
        assert!(err.retryable);

        let err: ErrorInfo = serde_json::from_value(serde_json::json!({
            "kind": "client_error",
            "message": "bad request",
            "http": {"status": 400}
        }))
        .unwrap();
        assert!(!err.retryable);

        let err: ErrorInfo = serde_json::from_value(serde_json::json!({
            "kind": "server_error",
            "message": "declared",
            "retryable": false
        }))
        .unwrap();
        assert!(!err.retryable);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = Outcome::error(ErrorInfo::http(429, "limited")).with_attempt(2);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["http"]["status"], 429);
        assert_eq!(json["error"]["retryable"], true);
        assert_eq!(json["meta"]["attempt"], 2);
        assert!(json.get("result").is_none());

        let ok = Outcome::ok(serde_json::json!({"rows": 3}));
        assert!(ok.is_ok());
        assert!(!ok.is_retryable());
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["result"]["rows"], 3);
    }
}
