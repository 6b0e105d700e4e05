//! NoETL DSL Types
//!
//! Two layers:
//! - [`Playbook`]: the document as authored, with each workflow step kept as
//!   raw YAML/JSON so legacy spellings survive until normalization.
//! - [`StepDefinition`]: the canonical, typed step produced by
//!   [`normalize`](crate::playbook::normalize). Everything downstream of the
//!   normalizer (router, policy evaluator, iterator expander, orchestrator)
//!   consumes only this form.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Name of the implicit terminal step.
pub const END_STEP: &str = "end";

/// Name of the conventional entry step.
pub const START_STEP: &str = "start";

/// Tool kind that runs a playbook as a child execution.
pub const PLAYBOOK_TOOL: &str = "playbook";

// ============================================================================
// Playbook document
// ============================================================================

/// Playbook metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Playbook name (required).
    pub name: String,

    /// Resource path.
    #[serde(default)]
    pub path: Option<String>,

    /// Description.
    #[serde(default)]
    pub description: Option<String>,

    /// Labels for filtering.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Workflow definition as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (noetl.io/v1 or noetl.io/v2), optional.
    #[serde(rename = "apiVersion", default)]
    pub api_version: Option<String>,

    /// Resource kind (Playbook), optional.
    #[serde(default)]
    pub kind: Option<String>,

    pub metadata: Metadata,

    /// Default workload, overlaid by the submitted workload.
    #[serde(default)]
    pub workload: Option<Value>,

    /// Workflow steps, not yet normalized.
    pub workflow: Vec<Value>,
}

impl Playbook {
    /// Get the playbook name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Get the resource path.
    pub fn path(&self) -> Option<&str> {
        self.metadata.path.as_deref()
    }

    /// Catalog reference: the path when set, otherwise the name.
    pub fn reference(&self) -> &str {
        self.path().unwrap_or_else(|| self.name())
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Action decided for a task outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Retry,
    Fail,
    Continue,
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Fail => write!(f, "fail"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl PolicyAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "fail" => Some(Self::Fail),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Always wait `delay`.
    Fixed,
    /// Wait `delay * n` before the n-th retry.
    Linear,
    /// Wait `delay * 2^(n-1)` before the n-th retry.
    Exponential,
}

impl std::fmt::Display for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Fixed => write!(f, "fixed"),
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

impl Backoff {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(Self::None),
            "fixed" | "constant" => Some(Self::Fixed),
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: f64 = 1.0;
/// Upper bound on any single retry wait, one day.
pub const MAX_RETRY_DELAY_SECS: f64 = 86_400.0;

/// The `then` half of a policy rule.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyThen {
    pub action: PolicyAction,
    /// Total attempts allowed (retry only).
    pub attempts: Option<u32>,
    pub backoff: Backoff,
    /// Base delay in seconds.
    pub delay: f64,
}

impl PolicyThen {
    pub fn fail() -> Self {
        Self {
            action: PolicyAction::Fail,
            attempts: None,
            backoff: Backoff::None,
            delay: DEFAULT_RETRY_DELAY_SECS,
        }
    }

    pub fn continue_() -> Self {
        Self {
            action: PolicyAction::Continue,
            ..Self::fail()
        }
    }

    pub fn retry(attempts: u32) -> Self {
        Self {
            action: PolicyAction::Retry,
            attempts: Some(attempts),
            ..Self::fail()
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("do".to_string(), json!(self.action.to_string()));
        if self.action == PolicyAction::Retry {
            map.insert(
                "attempts".to_string(),
                json!(self.attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS)),
            );
            map.insert("backoff".to_string(), json!(self.backoff.to_string()));
            map.insert("delay".to_string(), json!(self.delay));
        }
        Value::Object(map)
    }
}

/// A guarded policy decision. A rule without `when` always matches.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub when: Option<String>,
    pub then: PolicyThen,
}

impl PolicyRule {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(when) = &self.when {
            map.insert("when".to_string(), json!(when));
        }
        map.insert("then".to_string(), self.then.to_value());
        Value::Object(map)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// A successor reference with optional guard and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct NextTarget {
    pub step: String,
    pub when: Option<String>,
    pub args: Map<String, Value>,
}

impl NextTarget {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            when: None,
            args: Map::new(),
        }
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("step".to_string(), json!(self.step));
        if let Some(when) = &self.when {
            map.insert("when".to_string(), json!(when));
        }
        if !self.args.is_empty() {
            map.insert("args".to_string(), Value::Object(self.args.clone()));
        }
        Value::Object(map)
    }
}

/// One `case` entry: first branch whose guard holds wins.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseBranch {
    pub when: String,
    pub then: NextTarget,
}

// ============================================================================
// Step definition
// ============================================================================

/// Step type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Task,
    Iterator,
    Switch,
    End,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Iterator => write!(f, "iterator"),
            Self::Switch => write!(f, "switch"),
            Self::End => write!(f, "end"),
        }
    }
}

/// Iterator execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationMode {
    /// One child at a time, in collection order.
    #[default]
    Sequential,
    /// All children enqueued at once.
    Async,
}

impl std::fmt::Display for IterationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Tool invocation: kind plus unrendered configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub kind: String,
    pub config: Map<String, Value>,
}

impl ToolSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: Map::new(),
        }
    }

    /// `{kind, ...config}` mapping, as handed to the tool registry.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("kind".to_string(), json!(self.kind));
        for (k, v) in &self.config {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

/// Unit of work executed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub tool: ToolSpec,
    pub args: Map<String, Value>,
    pub policy: Vec<PolicyRule>,
}

impl TaskSpec {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("tool".to_string(), self.tool.to_value());
        if !self.args.is_empty() {
            map.insert("args".to_string(), Value::Object(self.args.clone()));
        }
        if !self.policy.is_empty() {
            map.insert("policy".to_string(), policy_to_value(&self.policy));
        }
        Value::Object(map)
    }
}

/// Fan-out of a nested task over a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct IteratorSpec {
    /// Template expression or literal list.
    pub collection: Value,
    /// Name the current element is bound to in each child's context.
    pub element: String,
    pub mode: IterationMode,
    pub task: TaskSpec,
}

/// Type-specific part of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Task(ToolSpec),
    Iterator(IteratorSpec),
    Switch,
    End,
}

/// Canonical step, validated once by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub desc: Option<String>,
    pub args: Map<String, Value>,
    pub policy: Vec<PolicyRule>,
    pub next: Vec<NextTarget>,
    pub case: Vec<CaseBranch>,
    pub sink: Option<Value>,
    pub kind: StepKind,
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        match self.kind {
            StepKind::Task(_) => StepType::Task,
            StepKind::Iterator(_) => StepType::Iterator,
            StepKind::Switch => StepType::Switch,
            StepKind::End => StepType::End,
        }
    }

    pub fn iterator(&self) -> Option<&IteratorSpec> {
        match &self.kind {
            StepKind::Iterator(spec) => Some(spec),
            _ => None,
        }
    }

    /// Steps that complete without a worker.
    pub fn is_inline(&self) -> bool {
        matches!(self.kind, StepKind::Switch | StepKind::End)
    }

    /// Policy for children of an iterator step: the nested task's rules,
    /// falling back to the step's own.
    pub fn child_policy(&self) -> &[PolicyRule] {
        match &self.kind {
            StepKind::Iterator(spec) if !spec.task.policy.is_empty() => &spec.task.policy,
            _ => &self.policy,
        }
    }

    /// Every step name this step can route to.
    pub fn successors(&self) -> impl Iterator<Item = &str> {
        self.next
            .iter()
            .map(|t| t.step.as_str())
            .chain(self.case.iter().map(|c| c.then.step.as_str()))
    }

    /// Canonical DSL mapping. Normalizing it yields `self` again.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("step".to_string(), json!(self.name));
        map.insert("type".to_string(), json!(self.step_type().to_string()));
        if let Some(desc) = &self.desc {
            map.insert("desc".to_string(), json!(desc));
        }
        if !self.args.is_empty() {
            map.insert("args".to_string(), Value::Object(self.args.clone()));
        }
        if !self.policy.is_empty() {
            map.insert("policy".to_string(), policy_to_value(&self.policy));
        }
        match &self.kind {
            StepKind::Task(tool) => {
                map.insert("tool".to_string(), tool.to_value());
            }
            StepKind::Iterator(spec) => {
                map.insert("collection".to_string(), spec.collection.clone());
                map.insert("element".to_string(), json!(spec.element));
                map.insert("mode".to_string(), json!(spec.mode.to_string()));
                map.insert("task".to_string(), spec.task.to_value());
            }
            StepKind::Switch | StepKind::End => {}
        }
        if let Some(sink) = &self.sink {
            map.insert("sink".to_string(), sink.clone());
        }
        if !self.next.is_empty() {
            map.insert(
                "next".to_string(),
                Value::Array(self.next.iter().map(NextTarget::to_value).collect()),
            );
        }
        if !self.case.is_empty() {
            let branches = self
                .case
                .iter()
                .map(|c| json!({"when": c.when, "then": c.then.to_value()}))
                .collect();
            map.insert("case".to_string(), Value::Array(branches));
        }
        Value::Object(map)
    }
}

impl Serialize for StepDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn policy_to_value(rules: &[PolicyRule]) -> Value {
    Value::Array(rules.iter().map(PolicyRule::to_value).collect())
}

// ============================================================================
// Normalized playbook
// ============================================================================

/// A playbook whose steps have all been normalized and cross-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPlaybook {
    pub metadata: Metadata,
    pub workload: Value,
    pub steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
}

impl NormalizedPlaybook {
    pub(crate) fn new(metadata: Metadata, workload: Value, steps: Vec<StepDefinition>) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self {
            metadata,
            workload,
            steps,
            index,
        }
    }

    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// `start` when declared, otherwise the first step.
    pub fn entry_step(&self) -> Option<&StepDefinition> {
        self.get_step(START_STEP).or_else(|| self.steps.first())
    }

    /// Get all step names.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            desc: None,
            args: Map::new(),
            policy: vec![],
            next: vec![],
            case: vec![],
            sink: None,
            kind: StepKind::Task(ToolSpec::new("noop")),
        }
    }

    #[test]
    fn test_policy_action_parse() {
        assert_eq!(PolicyAction::parse("Retry"), Some(PolicyAction::Retry));
        assert_eq!(PolicyAction::parse("continue"), Some(PolicyAction::Continue));
        assert_eq!(PolicyAction::parse("jump"), None);
        assert_eq!(Backoff::parse("constant"), Some(Backoff::Fixed));
    }

    #[test]
    fn test_step_to_value() {
        let mut step = task_step("fetch");
        step.policy.push(PolicyRule {
            when: Some("outcome.status == 'error'".to_string()),
            then: PolicyThen::retry(2),
        });
        step.next.push(NextTarget::new("done"));

        let value = step.to_value();
        assert_eq!(value["step"], "fetch");
        assert_eq!(value["type"], "task");
        assert_eq!(value["tool"]["kind"], "noop");
        assert_eq!(value["policy"][0]["then"]["do"], "retry");
        assert_eq!(value["policy"][0]["then"]["attempts"], 2);
        assert_eq!(value["next"][0]["step"], "done");
        assert!(value.get("case").is_none());
    }

    #[test]
    fn test_child_policy_fallback() {
        let mut step = task_step("loop");
        step.policy.push(PolicyRule {
            when: None,
            then: PolicyThen::continue_(),
        });
        step.kind = StepKind::Iterator(IteratorSpec {
            collection: json!("{{ items }}"),
            element: "item".to_string(),
            mode: IterationMode::Async,
            task: TaskSpec {
                tool: ToolSpec::new("noop"),
                args: Map::new(),
                policy: vec![],
            },
        });
        assert_eq!(step.child_policy().len(), 1);
        assert_eq!(step.step_type(), StepType::Iterator);
    }

    #[test]
    fn test_entry_step() {
        let metadata = Metadata {
            name: "p".to_string(),
            path: None,
            description: None,
            labels: None,
        };
        let playbook = NormalizedPlaybook::new(
            metadata.clone(),
            json!({}),
            vec![task_step("first"), task_step("start")],
        );
        assert_eq!(playbook.entry_step().unwrap().name, "start");

        let playbook = NormalizedPlaybook::new(metadata, json!({}), vec![task_step("first")]);
        assert_eq!(playbook.entry_step().unwrap().name, "first");
        assert!(playbook.has_step("first"));
        assert!(!playbook.has_step("end"));
    }
}
