//! No-op tool.

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::registry::{Tool, ToolConfig};

/// Returns `config.result` when present, otherwise the whole rendered config.
///
/// Useful for switch-like playbook steps that only shape data, and as a
/// stand-in while wiring a playbook before its real tools exist.
#[derive(Debug, Default)]
pub struct NoopTool;

impl NoopTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for NoopTool {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(
        &self,
        config: &ToolConfig,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError> {
        Ok(config
            .get("result")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(config.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::create_default_registry;

    #[tokio::test]
    async fn test_noop_returns_result_field() {
        let mut cfg = serde_json::Map::new();
        cfg.insert("result".to_string(), serde_json::json!({"id": 1}));
        let config = ToolConfig::new("noop").with_config(cfg);

        let value = NoopTool::new()
            .execute(&config, &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_noop_echoes_config() {
        let mut cfg = serde_json::Map::new();
        cfg.insert("message".to_string(), serde_json::json!("hi"));
        let config = ToolConfig::new("noop").with_config(cfg);

        let registry = create_default_registry();
        let outcome = registry
            .execute("noop", &config, &ExecutionContext::default())
            .await;
        assert!(outcome.is_ok());
        assert_eq!(outcome.result, Some(serde_json::json!({"message": "hi"})));
    }
}
