//! Workflow execution engine.
//!
//! - **State**: reconstructs execution state from events
//! - **Policy**: maps task outcomes to retry/fail/continue decisions
//! - **Iterator**: fans iterator steps out into iteration nodes
//! - **Router**: resolves `next`/`case` transitions
//! - **Orchestrator**: turns each recorded event into follow-up commands

pub mod commands;
pub mod iterator;
pub mod orchestrator;
pub mod policy;
pub mod router;
pub mod scope;
pub mod state;

pub use commands::{ChildRequest, Command, Job, Reaction};
pub use iterator::{child_node_id, expand, resolve_collection, Iteration, MAX_ITERATIONS};
pub use orchestrator::WorkflowOrchestrator;
pub use policy::{Decision, PolicyEvaluator};
pub use router::Router;
pub use scope::{Scope, ScopeLevel};
pub use state::{ExecutionState, NodeState, NodeStatus};
