//! Execution state reconstruction from events.
//!
//! [`ExecutionState`] is a left fold over an execution's events in
//! `event_id` order. Nothing else is authoritative: the orchestrator rebuilds
//! it on every pass instead of trusting a cache.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::models::{Event, EventType, ExecutionStatus};

/// State of a single node (step or iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Scheduled, not yet picked up by a worker.
    Scheduled,
    /// A worker started an attempt, or an iterator is fanned out.
    Running,
    /// Policy decided to retry; waiting for the next attempt.
    Retrying,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-node view of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    /// Playbook step this node runs.
    pub step: String,
    /// Iterator step owning this node, for iteration nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub status: NodeStatus,
    /// Latest 1-based attempt reported by a worker, 0 before the first.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<i64>,
    /// Event that opened the current generation of this node.
    pub scheduled_by: i64,
    /// Last event that changed this node.
    pub updated_by: i64,
    /// Arguments passed by the routing decision.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Element bound for iteration nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<Value>,
    /// Resolved collection, for iterator steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl NodeState {
    fn new(node_id: &str, step: &str, event_id: i64) -> Self {
        Self {
            node_id: node_id.to_string(),
            step: step.to_string(),
            parent: None,
            index: None,
            status: NodeStatus::Scheduled,
            attempt: 0,
            queue_id: None,
            scheduled_by: event_id,
            updated_by: event_id,
            args: Map::new(),
            element: None,
            items: None,
            last_outcome: None,
            result: None,
            error: None,
        }
    }

    /// Whether `event` belongs to an earlier generation of this node.
    ///
    /// Events reported from a child execution name their generation
    /// explicitly, since they are appended after the fact.
    pub fn is_stale(&self, event: &Event) -> bool {
        event.event_id < self.scheduled_by
            || event
                .field("generation")
                .and_then(Value::as_i64)
                .is_some_and(|generation| generation != self.scheduled_by)
    }
}

/// Complete execution state reconstructed from events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    pub playbook_reference: String,
    pub workload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
    /// Node of the parent execution waiting on this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    /// Generation of that node when this execution was spawned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_generation: Option<i64>,
    pub nodes: BTreeMap<String, NodeState>,
    pub last_event_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Create an empty state.
    pub fn new(execution_id: i64) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Running,
            playbook_reference: String::new(),
            workload: Value::Object(Map::new()),
            parent_execution_id: None,
            parent_node_id: None,
            parent_generation: None,
            nodes: BTreeMap::new(),
            last_event_id: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Reconstruct execution state from a list of events.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let start = Instant::now();
        let first = events.first()?;

        let mut state = Self::new(first.execution_id);
        for event in events {
            state.apply_event(event);
        }

        let duration = start.elapsed();
        tracing::debug!(
            target: "noetl.performance",
            execution_id = %first.execution_id,
            phase = "state_reconstruction",
            event_count = events.len(),
            node_count = state.nodes.len(),
            duration_ms = %duration.as_millis(),
            "State reconstructed from events"
        );

        if duration.as_millis() > 100 {
            tracing::warn!(
                target: "noetl.performance",
                execution_id = %first.execution_id,
                event_count = events.len(),
                duration_ms = %duration.as_millis(),
                "Slow state reconstruction detected"
            );
        }

        Some(state)
    }

    /// Apply a single event. Events after a terminal event change nothing.
    pub fn apply_event(&mut self, event: &Event) {
        if self.status.is_terminal() {
            return;
        }
        self.last_event_id = self.last_event_id.max(event.event_id);

        let ctx = &event.context;
        match event.event_type {
            EventType::ExecutionStart => {
                self.started_at = Some(event.created_at);
                if let Some(workload) = ctx.get("workload") {
                    self.workload = workload.clone();
                }
                if let Some(reference) = ctx.get("playbook_reference").and_then(Value::as_str) {
                    self.playbook_reference = reference.to_string();
                }
                self.parent_execution_id = ctx.get("parent_execution_id").and_then(Value::as_i64);
                self.parent_node_id = ctx
                    .get("parent_node_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.parent_generation = ctx.get("parent_generation").and_then(Value::as_i64);
            }
            EventType::StepScheduled => self.apply_scheduled(event),
            EventType::StepStarted => {
                if let Some(node) = self.live_node_mut(event) {
                    let attempt = event.attempt().unwrap_or(1);
                    if attempt >= node.attempt {
                        node.status = NodeStatus::Running;
                        node.attempt = attempt;
                        node.queue_id = event.queue_id().or(node.queue_id);
                        node.updated_by = event.event_id;
                    }
                }
            }
            EventType::ActionCompleted | EventType::ActionFailed => {
                if let Some(node) = self.live_node_mut(event) {
                    let attempt = event.attempt().unwrap_or(node.attempt);
                    if attempt >= node.attempt {
                        node.attempt = attempt;
                        node.queue_id = event.queue_id().or(node.queue_id);
                        node.last_outcome = ctx.get("outcome").cloned();
                        node.updated_by = event.event_id;
                    }
                }
            }
            EventType::StepRetry => {
                if let Some(node) = self.live_node_mut(event) {
                    node.status = NodeStatus::Retrying;
                    node.updated_by = event.event_id;
                }
            }
            EventType::IteratorStarted => self.apply_iterator_started(event),
            EventType::StepCompleted => {
                if let Some(node) = self.live_node_mut(event) {
                    node.status = NodeStatus::Completed;
                    node.result = Some(ctx.get("result").cloned().unwrap_or(Value::Null));
                    node.error = ctx.get("error").filter(|e| !e.is_null()).cloned();
                    node.updated_by = event.event_id;
                }
            }
            EventType::StepFailed => {
                if let Some(node) = self.live_node_mut(event) {
                    node.status = NodeStatus::Failed;
                    node.error = ctx.get("error").cloned();
                    node.updated_by = event.event_id;
                }
            }
            EventType::PlaybookCompleted => {
                self.status = ExecutionStatus::Completed;
                self.completed_at = Some(event.created_at);
            }
            EventType::PlaybookFailed => {
                self.status = ExecutionStatus::Failed;
                self.completed_at = Some(event.created_at);
            }
            EventType::Custom(_) => {}
        }
    }

    fn apply_scheduled(&mut self, event: &Event) {
        let name = event.node_name.as_str();
        let args = event
            .context
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        match self.nodes.get(name) {
            Some(node) if node.status.is_active() => return,
            Some(_) => {
                // Loop-back: a new generation replaces the finished one.
                self.nodes
                    .retain(|_, n| n.parent.as_deref() != Some(name));
            }
            None => {}
        }

        let mut node = NodeState::new(name, name, event.event_id);
        node.args = args;
        self.nodes.insert(name.to_string(), node);
    }

    fn apply_iterator_started(&mut self, event: &Event) {
        let name = event.node_name.clone();
        let items = event
            .context
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let Some(node) = self.nodes.get_mut(&name) else {
            return;
        };
        if node.status != NodeStatus::Scheduled || node.is_stale(event) {
            return;
        }
        node.status = NodeStatus::Running;
        node.items = Some(items.clone());
        node.updated_by = event.event_id;

        for (index, element) in items.into_iter().enumerate() {
            let node_id = crate::engine::iterator::child_node_id(&name, index);
            let mut child = NodeState::new(&node_id, &name, event.event_id);
            child.parent = Some(name.clone());
            child.index = Some(index);
            child.element = Some(element);
            self.nodes.insert(node_id, child);
        }
    }

    /// Node for a worker/decision event, unless it is finished or the event
    /// belongs to an earlier generation.
    fn live_node_mut(&mut self, event: &Event) -> Option<&mut NodeState> {
        self.nodes
            .get_mut(&event.node_name)
            .filter(|node| node.status.is_active() && !node.is_stale(event))
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.get(node_id)
    }

    /// Whether any node has not reached a terminal status.
    pub fn has_active_nodes(&self) -> bool {
        self.nodes.values().any(|n| n.status.is_active())
    }

    /// Iteration nodes of an iterator step, in index order.
    pub fn children(&self, step: &str) -> Vec<&NodeState> {
        let mut children: Vec<&NodeState> = self
            .nodes
            .values()
            .filter(|n| n.parent.as_deref() == Some(step))
            .collect();
        children.sort_by_key(|n| n.index);
        children
    }

    /// Get the result for a specific step.
    pub fn get_step_result(&self, step_name: &str) -> Option<&Value> {
        self.nodes.get(step_name).and_then(|n| n.result.as_ref())
    }

    /// Build the template context.
    ///
    /// Workload keys are available flattened and under `workload`; each
    /// completed top-level step's result is available under its name and
    /// under `steps`.
    pub fn build_context(&self) -> Map<String, Value> {
        let mut context = Map::new();

        if let Value::Object(workload) = &self.workload {
            for (k, v) in workload {
                context.insert(k.clone(), v.clone());
            }
        }
        context.insert("workload".to_string(), self.workload.clone());
        context.insert("execution_id".to_string(), Value::from(self.execution_id));

        let mut steps = Map::new();
        for node in self.nodes.values().filter(|n| n.parent.is_none()) {
            if node.status == NodeStatus::Completed {
                let result = node.result.clone().unwrap_or(Value::Null);
                context.insert(node.node_id.clone(), result.clone());
                steps.insert(node.node_id.clone(), result);
            }
        }
        context.insert("steps".to_string(), Value::Object(steps));

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventStatus, NewEvent};
    use serde_json::json;

    struct Log {
        events: Vec<Event>,
    }

    impl Log {
        fn new() -> Self {
            Self { events: Vec::new() }
        }

        fn push(&mut self, node: &str, event_type: EventType, context: Value) -> i64 {
            let id = self.events.len() as i64 + 1;
            let event = NewEvent::new(1, node, event_type, EventStatus::Completed)
                .with_context(context)
                .into_event(id, Utc::now());
            self.events.push(event);
            id
        }

        fn state(&self) -> ExecutionState {
            ExecutionState::from_events(&self.events).unwrap()
        }
    }

    #[test]
    fn test_empty_log_has_no_state() {
        assert!(ExecutionState::from_events(&[]).is_none());
    }

    #[test]
    fn test_task_lifecycle() {
        let mut log = Log::new();
        log.push(
            "demo",
            EventType::ExecutionStart,
            json!({"workload": {"region": "eu"}, "playbook_reference": "demo"}),
        );
        log.push("fetch", EventType::StepScheduled, json!({"args": {"page": 1}}));
        log.push("fetch", EventType::StepStarted, json!({"attempt": 1, "queue_id": 9}));

        let state = log.state();
        let node = state.node("fetch").unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.queue_id, Some(9));
        assert_eq!(node.args.get("page"), Some(&json!(1)));
        assert!(state.has_active_nodes());

        log.push(
            "fetch",
            EventType::ActionCompleted,
            json!({"attempt": 1, "outcome": {"status": "ok", "result": {"rows": 3}}}),
        );
        log.push("fetch", EventType::StepCompleted, json!({"result": {"rows": 3}}));

        let state = log.state();
        assert_eq!(state.node("fetch").unwrap().status, NodeStatus::Completed);
        assert!(!state.has_active_nodes());

        let context = state.build_context();
        assert_eq!(context["region"], "eu");
        assert_eq!(context["workload"]["region"], "eu");
        assert_eq!(context["fetch"]["rows"], 3);
        assert_eq!(context["steps"]["fetch"]["rows"], 3);
        assert_eq!(context["execution_id"], 1);
    }

    #[test]
    fn test_iterator_creates_children() {
        let mut log = Log::new();
        log.push("demo", EventType::ExecutionStart, json!({"workload": {}}));
        log.push("fan", EventType::StepScheduled, json!({}));
        log.push("fan", EventType::IteratorStarted, json!({"count": 2, "items": ["a", "b"]}));

        let state = log.state();
        let children = state.children("fan");
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].node_id, "fan[0]");
        assert_eq!(children[1].element, Some(json!("b")));
        assert_eq!(state.node("fan").unwrap().status, NodeStatus::Running);
    }

    #[test]
    fn test_loop_back_resets_node() {
        let mut log = Log::new();
        log.push("demo", EventType::ExecutionStart, json!({}));
        log.push("fan", EventType::StepScheduled, json!({}));
        log.push("fan", EventType::IteratorStarted, json!({"items": [1]}));
        log.push("fan[0]", EventType::StepCompleted, json!({"result": 1}));
        log.push("fan", EventType::StepCompleted, json!({"result": [1]}));
        let rescheduled = log.push("fan", EventType::StepScheduled, json!({}));

        let state = log.state();
        let node = state.node("fan").unwrap();
        assert_eq!(node.status, NodeStatus::Scheduled);
        assert_eq!(node.scheduled_by, rescheduled);
        assert!(node.result.is_none());
        assert!(state.children("fan").is_empty());
    }

    #[test]
    fn test_schedule_while_active_is_ignored() {
        let mut log = Log::new();
        log.push("demo", EventType::ExecutionStart, json!({}));
        let first = log.push("join", EventType::StepScheduled, json!({}));
        log.push("join", EventType::StepScheduled, json!({}));

        assert_eq!(log.state().node("join").unwrap().scheduled_by, first);
    }

    #[test]
    fn test_stale_outcome_ignored() {
        let mut log = Log::new();
        log.push("demo", EventType::ExecutionStart, json!({}));
        log.push("fetch", EventType::StepScheduled, json!({}));
        log.push("fetch", EventType::StepStarted, json!({"attempt": 2}));
        log.push(
            "fetch",
            EventType::ActionFailed,
            json!({"attempt": 1, "outcome": {"status": "error"}}),
        );

        let state = log.state();
        let node = state.node("fetch").unwrap();
        assert_eq!(node.attempt, 2);
        assert!(node.last_outcome.is_none());
    }

    #[test]
    fn test_outcome_for_other_generation_ignored() {
        let mut log = Log::new();
        log.push(
            "child",
            EventType::ExecutionStart,
            json!({"parent_execution_id": 7, "parent_node_id": "fan[0]", "parent_generation": 3}),
        );
        let scheduled = log.push("fetch", EventType::StepScheduled, json!({}));
        log.push("fetch", EventType::StepStarted, json!({"attempt": 1, "generation": scheduled}));
        log.push(
            "fetch",
            EventType::ActionCompleted,
            json!({"attempt": 1, "generation": scheduled - 1, "outcome": {"status": "ok"}}),
        );

        let state = log.state();
        assert_eq!(state.parent_execution_id, Some(7));
        assert_eq!(state.parent_node_id.as_deref(), Some("fan[0]"));
        assert_eq!(state.parent_generation, Some(3));
        let node = state.node("fetch").unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert!(node.last_outcome.is_none());
    }

    #[test]
    fn test_terminal_event_freezes_state() {
        let mut log = Log::new();
        log.push("demo", EventType::ExecutionStart, json!({}));
        log.push("demo", EventType::PlaybookFailed, json!({}));
        log.push("late", EventType::StepScheduled, json!({}));

        let state = log.state();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.node("late").is_none());
        assert_eq!(state.last_event_id, 2);
    }
}
