//! Commands produced by the orchestrator and the job payload handed to workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::models::{EnqueueRequest, NewEvent, NodeType};

/// Effect requested by a reaction. Applying the same command twice has the
/// same effect as applying it once.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Append an event (deduplicated by its idempotency key).
    Append(NewEvent),
    /// Enqueue a node (deduplicated by the active-node guard).
    Enqueue(EnqueueRequest),
    /// Return a queue item for another attempt (conditional on its attempt count).
    Requeue {
        queue_id: i64,
        expected_attempt: i32,
        delay: Duration,
    },
    /// Run a node as a child execution (deduplicated by the node's claim event).
    StartChild(ChildRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Append(_) => "append",
            Command::Enqueue(_) => "enqueue",
            Command::Requeue { .. } => "requeue",
            Command::StartChild(_) => "start_child",
        }
    }
}

/// Commands produced for one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaction {
    pub commands: Vec<Command>,
}

impl Reaction {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn append(&mut self, event: NewEvent) {
        self.push(Command::Append(event));
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Appended events, in order.
    pub fn events(&self) -> impl Iterator<Item = &NewEvent> {
        self.commands.iter().filter_map(|c| match c {
            Command::Append(event) => Some(event),
            _ => None,
        })
    }
}

/// A node handed to a child playbook execution instead of the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRequest {
    pub execution_id: i64,
    pub node_id: String,
    /// `scheduled_by` of the node when the child was requested.
    pub generation: i64,
    pub reference: String,
    pub workload: Value,
}

/// Rendered unit of work stored as a queue item's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub execution_id: i64,
    pub node_id: String,
    /// Playbook step the node belongs to.
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Tool kind plus rendered configuration.
    pub tool: Value,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Template context the job was rendered with.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl Job {
    pub fn node_type(&self) -> NodeType {
        if self.index.is_some() {
            NodeType::Iteration
        } else {
            NodeType::Step
        }
    }

    /// Tool kind, if the rendered tool carries one.
    pub fn tool_kind(&self) -> Option<&str> {
        self.tool.get("kind").and_then(Value::as_str)
    }

    pub fn into_request(self) -> serde_json::Result<EnqueueRequest> {
        Ok(EnqueueRequest {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            node_type: self.node_type(),
            payload: serde_json::to_value(&self)?,
        })
    }
}
