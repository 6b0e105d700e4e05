//! Execution context passed to tools.

use serde::{Deserialize, Serialize};

/// Identity and variables of the job a tool is executing for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: i64,

    /// Queue node id (`step` or `step[index]`).
    pub node_id: String,

    /// Step name in the playbook.
    pub step: String,

    #[serde(default)]
    pub queue_id: i64,

    /// 1-based attempt number.
    #[serde(default)]
    pub attempt: u32,

    #[serde(default)]
    pub worker_id: String,

    /// Human-readable trace identifier of the executing scope.
    #[serde(default)]
    pub scope: String,

    /// Rendered template context (workload, prior results, args, element binding).
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: i64, node_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            step: step.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: serde_json::Map<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Look up a variable by name.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_variables() {
        let mut vars = serde_json::Map::new();
        vars.insert("item".to_string(), serde_json::json!("a"));
        let ctx = ExecutionContext::new(7, "fetch[0]", "fetch").with_variables(vars);
        assert_eq!(ctx.get("item"), Some(&serde_json::json!("a")));
        assert!(ctx.get("missing").is_none());
        assert_eq!(ctx.attempt, 0);
    }
}
