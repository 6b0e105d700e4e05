//! Tool registry and dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::outcome::Outcome;

/// Configuration for tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool kind (e.g., "http", "postgres", "noop").
    pub kind: String,

    /// Tool-specific configuration, already rendered.
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,

    /// Timeout in seconds (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ToolConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: serde_json::Map::new(),
            timeout: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Map<String, serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    /// Look up a configuration entry.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }
}

/// Tool trait for implementing executable tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's unique kind.
    fn name(&self) -> &'static str;

    /// Execute the tool with the given configuration and context.
    async fn execute(
        &self,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Capability map of available tools.
///
/// Built by the host process and handed to workers; there is no global
/// registry.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register a shared tool instance.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a tool by kind.
    ///
    /// Never fails: a missing tool, a timeout, or a tool error all come back
    /// as an `error` outcome so the caller can hand it to a retry policy.
    pub async fn execute(
        &self,
        kind: &str,
        config: &ToolConfig,
        ctx: &ExecutionContext,
    ) -> Outcome {
        let started = Instant::now();

        let result = match self.get(kind) {
            Some(tool) => match config.timeout {
                Some(secs) => {
                    match tokio::time::timeout(
                        Duration::from_secs(secs),
                        tool.execute(config, ctx),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ToolError::Timeout(secs)),
                    }
                }
                None => tool.execute(config, ctx).await,
            },
            None => Err(ToolError::NotFound(kind.to_string())),
        };

        let outcome = match result {
            Ok(value) => Outcome::ok(value),
            Err(e) => {
                tracing::debug!(
                    tool = %kind,
                    node_id = %ctx.node_id,
                    error = %e,
                    "Tool returned error"
                );
                Outcome::error(e.to_error_info())
            }
        };

        outcome
            .with_tool(kind)
            .with_attempt(ctx.attempt)
            .with_duration_ms(started.elapsed().as_millis() as u64)
    }

    /// Execute a tool from config (uses config.kind as tool name).
    pub async fn execute_from_config(&self, config: &ToolConfig, ctx: &ExecutionContext) -> Outcome {
        self.execute(&config.kind, config, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}
