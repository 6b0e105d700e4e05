//! Workflow orchestration engine.
//!
//! [`WorkflowOrchestrator::react`] is a pure function of the folded state, the
//! normalized playbook and one event. It returns the commands that move the
//! execution forward:
//! - every decision is first recorded as an event with a deterministic
//!   idempotency key
//! - queue side effects are issued in reaction to that recorded event
//!
//! Reacting to the same event twice therefore yields duplicate appends (no-ops
//! by key), duplicate enqueues (rejected by the active-node guard) and
//! duplicate requeues (rejected by the attempt check). Nodes using the
//! `playbook` tool start a child execution instead of a queue item; the
//! child reports back with an ordinary outcome event.

use std::sync::Arc;
use std::time::Duration;

use noetl_tools::{ErrorInfo, ErrorKind, Outcome};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::db::models::{Event, EventStatus, EventType, NewEvent};
use crate::error::{EngineError, EngineResult};
use crate::playbook::{
    IterationMode, NextTarget, NormalizedPlaybook, PolicyAction, StepDefinition, StepKind,
    ToolSpec, END_STEP, PLAYBOOK_TOOL,
};
use crate::result_ext::OptionResultExt;
use crate::template::{RenderContext, TemplateRenderer};

use super::commands::{ChildRequest, Command, Job, Reaction};
use super::iterator::{expand, resolve_collection, Iteration};
use super::policy::{bounded_delay, PolicyEvaluator};
use super::router::{is_virtual_end, Router};
use super::scope::Scope;
use super::state::{ExecutionState, NodeState, NodeStatus};

/// Workflow orchestrator.
#[derive(Debug, Clone)]
pub struct WorkflowOrchestrator {
    renderer: Arc<TemplateRenderer>,
    router: Router,
    policy: PolicyEvaluator,
}

impl Default for WorkflowOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowOrchestrator {
    /// Create a new workflow orchestrator.
    pub fn new() -> Self {
        Self::with_renderer(Arc::new(TemplateRenderer::new()))
    }

    pub fn with_renderer(renderer: Arc<TemplateRenderer>) -> Self {
        Self {
            router: Router::new(renderer.clone()),
            policy: PolicyEvaluator::new(renderer.clone()),
            renderer,
        }
    }

    /// Commands to apply in reaction to `event`, given the current state.
    pub fn react(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> EngineResult<Reaction> {
        if state.status.is_terminal() {
            return Ok(Reaction::none());
        }

        let reaction = match event.event_type {
            EventType::ExecutionStart => self.on_execution_start(state, playbook, event),
            EventType::StepScheduled => self.on_step_scheduled(state, playbook, event)?,
            EventType::IteratorStarted => self.on_iterator_started(state, playbook, event)?,
            EventType::ActionCompleted | EventType::ActionFailed => {
                self.on_outcome(state, playbook, event)
            }
            EventType::StepRetry => self.on_retry(state, event),
            EventType::StepCompleted => self.on_step_completed(state, playbook, event)?,
            EventType::StepFailed => self.on_step_failed(state, playbook, event),
            EventType::StepStarted
            | EventType::PlaybookCompleted
            | EventType::PlaybookFailed
            | EventType::Custom(_) => Reaction::none(),
        };

        if !reaction.is_empty() {
            debug!(
                execution_id = state.execution_id,
                event_id = event.event_id,
                event_type = %event.event_type,
                node_id = %event.node_name,
                commands = reaction.commands.len(),
                "Reaction computed"
            );
        }

        Ok(reaction)
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    fn on_execution_start(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> Reaction {
        let mut reaction = Reaction::none();
        match playbook.entry_step() {
            Some(entry) => {
                reaction.append(scheduled_event(state, &entry.name, Map::new(), event.event_id));
            }
            None => reaction.append(playbook_failed(
                state,
                &event.node_name,
                EngineError::Validation("Playbook has no steps".to_string()).descriptor(),
            )),
        }
        reaction
    }

    fn on_step_scheduled(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> EngineResult<Reaction> {
        let mut reaction = Reaction::none();
        let Some(node) = state.node(&event.node_name) else {
            return Ok(reaction);
        };
        if node.status != NodeStatus::Scheduled || node.scheduled_by != event.event_id {
            return Ok(reaction);
        }
        let Some(step) = playbook.get_step(&node.step) else {
            reaction.append(step_failed(
                state,
                node,
                EngineError::Validation(format!("Unknown step '{}'", node.step)).descriptor(),
            ));
            return Ok(reaction);
        };

        match &step.kind {
            StepKind::Task(tool) => {
                match self
                    .build_job(state, step, node, tool, &Map::new(), None)
                    .and_then(|job| dispatch(job, node.scheduled_by))
                {
                    Ok(command) => reaction.push(command),
                    Err(e) => reaction.append(step_failed(state, node, e.descriptor())),
                }
            }
            StepKind::Switch | StepKind::End => {
                let ctx = self.node_context(state, node, None);
                match self.render_args(&step.args, node, &ctx) {
                    Ok(args) => {
                        reaction.append(step_completed(state, node, Value::Object(args), None))
                    }
                    Err(e) => reaction.append(step_failed(state, node, e.descriptor())),
                }
            }
            StepKind::Iterator(spec) => {
                let ctx = self.node_context(state, node, None);
                match resolve_collection(&self.renderer, &spec.collection, &ctx) {
                    Ok(items) => {
                        let count = items.len();
                        reaction.append(
                            NewEvent::new(
                                state.execution_id,
                                &node.node_id,
                                EventType::IteratorStarted,
                                EventStatus::Running,
                            )
                            .with_context(json!({
                                "count": count,
                                "items": items,
                                "mode": spec.mode.to_string(),
                                "scope": node_scope(state, node).to_string(),
                            }))
                            .with_key(format!("iterator:{}:{}", node.node_id, node.scheduled_by)),
                        );
                        if count == 0 {
                            reaction.append(step_completed(state, node, json!([]), None));
                        }
                        info!(
                            execution_id = state.execution_id,
                            step = %step.name,
                            count,
                            "Iterator expanded"
                        );
                    }
                    Err(e) => reaction.append(step_failed(state, node, e.descriptor())),
                }
            }
        }

        Ok(reaction)
    }

    fn on_iterator_started(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> EngineResult<Reaction> {
        let Some(node) = state.node(&event.node_name) else {
            return Ok(Reaction::none());
        };
        if node.status != NodeStatus::Running || node.is_stale(event) {
            return Ok(Reaction::none());
        }
        let Some(step) = playbook.get_step(&node.step) else {
            return Ok(Reaction::none());
        };
        self.enqueue_ready_children(state, step, node)
    }

    fn on_outcome(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> Reaction {
        let mut reaction = Reaction::none();
        let Some(node) = state.node(&event.node_name) else {
            return reaction;
        };
        let attempt = event.attempt().unwrap_or(1);
        if node.status.is_terminal() || node.is_stale(event) || attempt < node.attempt {
            return reaction;
        }
        if node.status == NodeStatus::Retrying && attempt == node.attempt {
            return reaction;
        }

        let owner = node.parent.as_deref().unwrap_or(&node.step);
        let Some(step) = playbook.get_step(owner).log_none(format!("step '{}'", owner)) else {
            return reaction;
        };
        let rules = if node.parent.is_some() {
            step.child_policy()
        } else {
            &step.policy
        };

        let outcome = parse_outcome(event, attempt);
        let ctx = self.node_context(state, node, bindings_for(node, step));
        let decision = self.policy.evaluate(&outcome, rules, &ctx);

        match decision.action {
            PolicyAction::Continue => {
                let error = outcome
                    .error
                    .as_ref()
                    .map(|e| serde_json::to_value(e).unwrap_or_default());
                reaction.append(step_completed(
                    state,
                    node,
                    outcome.result.clone().unwrap_or(Value::Null),
                    error,
                ));
            }
            PolicyAction::Retry if decision.allows_retry(attempt) => {
                match event.queue_id().or(node.queue_id) {
                    Some(queue_id) => {
                        let delay = decision.delay_for_retry(attempt);
                        info!(
                            execution_id = state.execution_id,
                            node_id = %node.node_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying node"
                        );
                        reaction.append(
                            NewEvent::new(
                                state.execution_id,
                                &node.node_id,
                                EventType::StepRetry,
                                EventStatus::Retrying,
                            )
                            .with_context(json!({
                                "queue_id": queue_id,
                                "attempt": attempt,
                                "delay_secs": delay.as_secs_f64(),
                                "rule": decision.rule_index,
                                "error": outcome.error,
                                "scope": node_scope(state, node).to_string(),
                            }))
                            .with_key(format!(
                                "retry:{}:{}:{}",
                                node.node_id, node.scheduled_by, attempt
                            )),
                        );
                    }
                    None => reaction.append(step_failed(
                        state,
                        node,
                        EngineError::TerminalTool(format!(
                            "cannot retry node '{}' without a queue item",
                            node.node_id
                        ))
                        .descriptor(),
                    )),
                }
            }
            PolicyAction::Retry | PolicyAction::Fail => {
                let message = outcome
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "policy decided to fail".to_string());
                let mut descriptor = EngineError::TerminalTool(message).descriptor();
                descriptor["attempts"] = json!(attempt);
                descriptor["cause"] = serde_json::to_value(&outcome.error).unwrap_or_default();
                if decision.action == PolicyAction::Retry {
                    descriptor["retries_exhausted"] = json!(true);
                }
                reaction.append(step_failed(state, node, descriptor));
            }
        }

        reaction
    }

    fn on_retry(&self, state: &ExecutionState, event: &Event) -> Reaction {
        let mut reaction = Reaction::none();
        let Some(node) = state.node(&event.node_name) else {
            return reaction;
        };
        if node.status != NodeStatus::Retrying || node.is_stale(event) {
            return reaction;
        }
        let (Some(queue_id), Some(attempt)) = (event.queue_id(), event.attempt()) else {
            warn!(event_id = event.event_id, "Retry event without queue_id or attempt");
            return reaction;
        };
        let delay = event
            .field("delay_secs")
            .and_then(Value::as_f64)
            .map(bounded_delay)
            .unwrap_or(Duration::ZERO);

        reaction.push(Command::Requeue {
            queue_id,
            expected_attempt: attempt.saturating_sub(1) as i32,
            delay,
        });
        reaction
    }

    fn on_step_completed(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> EngineResult<Reaction> {
        let mut reaction = Reaction::none();
        let Some(node) = state.node(&event.node_name) else {
            return Ok(reaction);
        };
        if node.status != NodeStatus::Completed || node.is_stale(event) {
            return Ok(reaction);
        }

        if let Some(parent_name) = node.parent.as_deref() {
            let Some(parent) = state.node(parent_name).filter(|p| p.status.is_active()) else {
                return Ok(reaction);
            };
            let children = state.children(parent_name);
            if children.iter().all(|c| c.status == NodeStatus::Completed) {
                let results: Vec<Value> = children
                    .iter()
                    .map(|c| c.result.clone().unwrap_or(Value::Null))
                    .collect();
                reaction.append(step_completed(state, parent, Value::Array(results), None));
            } else if let Some(step) = playbook.get_step(parent_name) {
                // Async iterations were all enqueued when the iterator started.
                if step.iterator().map(|spec| spec.mode) == Some(IterationMode::Sequential) {
                    reaction = self.enqueue_ready_children(state, step, parent)?;
                }
            }
            return Ok(reaction);
        }

        let Some(step) = playbook.get_step(&node.step) else {
            return Ok(reaction);
        };
        let mut ctx = self.node_context(state, node, None);
        ctx.insert(
            "result".to_string(),
            node.result.clone().unwrap_or(Value::Null),
        );
        if let Some(outcome) = &node.last_outcome {
            ctx.insert("outcome".to_string(), outcome.clone());
        }

        let targets = self.router.next(step, &ctx);
        let has_end_step = playbook.has_step(END_STEP);
        let real: Vec<&NextTarget> = targets
            .iter()
            .filter(|t| !is_virtual_end(&t.step, has_end_step))
            .collect();

        if real.is_empty() {
            if !state.has_active_nodes() {
                reaction.append(playbook_completed(state, &node.node_id));
            }
            return Ok(reaction);
        }

        for target in real {
            self.route_to(state, target, &ctx, event.event_id, &mut reaction);
        }
        Ok(reaction)
    }

    fn on_step_failed(
        &self,
        state: &ExecutionState,
        playbook: &NormalizedPlaybook,
        event: &Event,
    ) -> Reaction {
        let mut reaction = Reaction::none();
        let Some(node) = state.node(&event.node_name) else {
            return reaction;
        };
        if node.status != NodeStatus::Failed || node.is_stale(event) {
            return reaction;
        }

        if let Some(parent_name) = node.parent.as_deref() {
            if let Some(parent) = state.node(parent_name).filter(|p| p.status.is_active()) {
                let mut descriptor =
                    EngineError::TerminalTool(format!("iteration '{}' failed", node.node_id))
                        .descriptor();
                descriptor["cause"] = node.error.clone().unwrap_or(Value::Null);
                reaction.append(step_failed(state, parent, descriptor));
            }
            return reaction;
        }

        let error = node.error.clone().unwrap_or(Value::Null);
        let Some(step) = playbook.get_step(&node.step) else {
            reaction.append(playbook_failed(state, &node.node_id, error));
            return reaction;
        };

        let mut ctx = self.node_context(state, node, None);
        ctx.insert("error".to_string(), error.clone());
        if let Some(outcome) = &node.last_outcome {
            ctx.insert("outcome".to_string(), outcome.clone());
        }

        match self.router.on_failure(step, &ctx) {
            Some(target) if !is_virtual_end(&target.step, playbook.has_step(END_STEP)) => {
                info!(
                    execution_id = state.execution_id,
                    step = %step.name,
                    target = %target.step,
                    "Routing failed step"
                );
                self.route_to(state, &target, &ctx, event.event_id, &mut reaction);
            }
            _ => {
                warn!(
                    execution_id = state.execution_id,
                    step = %step.name,
                    "Step failed without a handler, failing playbook"
                );
                reaction.append(playbook_failed(state, &node.node_id, error));
            }
        }
        reaction
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Schedule `target` as a successor of the event `trigger`.
    fn route_to(
        &self,
        state: &ExecutionState,
        target: &NextTarget,
        ctx: &RenderContext,
        trigger: i64,
        reaction: &mut Reaction,
    ) {
        if let Some(existing) = state.node(&target.step) {
            if existing.status.is_active() || existing.updated_by > trigger {
                debug!(
                    execution_id = state.execution_id,
                    target = %target.step,
                    "Target already active or rescheduled, skipping"
                );
                return;
            }
        }

        match self.renderer.render_value(&Value::Object(target.args.clone()), ctx) {
            Ok(Value::Object(args)) => {
                reaction.append(scheduled_event(state, &target.step, args, trigger));
            }
            Ok(_) => {}
            Err(e) => {
                reaction.append(scheduled_event(state, &target.step, Map::new(), trigger));
                reaction.append(
                    NewEvent::new(
                        state.execution_id,
                        &target.step,
                        EventType::StepFailed,
                        EventStatus::Failed,
                    )
                    .with_context(json!({"error": e.descriptor()}))
                    .with_key(format!("failed:{}:trigger:{}", target.step, trigger)),
                );
            }
        }
    }

    /// Enqueue the iteration nodes that may run now.
    fn enqueue_ready_children(
        &self,
        state: &ExecutionState,
        step: &StepDefinition,
        parent: &NodeState,
    ) -> EngineResult<Reaction> {
        let mut reaction = Reaction::none();
        let Some(spec) = step.iterator() else {
            return Ok(reaction);
        };
        let items = parent.items.clone().unwrap_or_default();
        let iterations = expand(step, &items)?;

        let ready: Vec<&Iteration> = match spec.mode {
            IterationMode::Async => iterations
                .iter()
                .filter(|it| {
                    state
                        .node(&it.node_id)
                        .map(|n| n.status == NodeStatus::Scheduled)
                        .unwrap_or(false)
                })
                .collect(),
            IterationMode::Sequential => iterations
                .iter()
                .find(|it| {
                    state
                        .node(&it.node_id)
                        .map(|n| n.status != NodeStatus::Completed)
                        .unwrap_or(false)
                })
                .filter(|it| {
                    state
                        .node(&it.node_id)
                        .map(|n| n.status == NodeStatus::Scheduled)
                        .unwrap_or(false)
                })
                .into_iter()
                .collect(),
        };

        for iteration in ready {
            let Some(child) = state.node(&iteration.node_id) else {
                continue;
            };
            match self
                .build_job(
                    state,
                    step,
                    parent,
                    &iteration.task.tool,
                    &iteration.task.args,
                    Some(iteration),
                )
                .and_then(|job| dispatch(job, child.scheduled_by))
            {
                Ok(command) => reaction.push(command),
                Err(e) => reaction.append(step_failed(state, child, e.descriptor())),
            }
        }
        Ok(reaction)
    }

    /// Render a task into a job.
    ///
    /// `node` carries the routed arguments: the step node itself, or the
    /// iterator node for an iteration.
    fn build_job(
        &self,
        state: &ExecutionState,
        step: &StepDefinition,
        node: &NodeState,
        tool: &ToolSpec,
        task_args: &Map<String, Value>,
        iteration: Option<&Iteration>,
    ) -> EngineResult<Job> {
        let bindings = iteration.map(Iteration::bindings);
        let ctx = self.node_context(state, node, bindings);

        let mut raw_args = step.args.clone();
        for (k, v) in task_args {
            raw_args.insert(k.clone(), v.clone());
        }
        let args = self.render_args(&raw_args, node, &ctx)?;

        let mut variables: Map<String, Value> = ctx.into_iter().collect();
        for (k, v) in &args {
            variables.insert(k.clone(), v.clone());
        }
        variables.insert("args".to_string(), Value::Object(args.clone()));
        let render_ctx: RenderContext = variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let tool = self.renderer.render_value(&tool.to_value(), &render_ctx)?;

        Ok(Job {
            execution_id: state.execution_id,
            node_id: iteration
                .map(|it| it.node_id.clone())
                .unwrap_or_else(|| node.node_id.clone()),
            step: step.name.clone(),
            index: iteration.map(|it| it.index),
            tool,
            args,
            variables,
        })
    }

    /// Render step arguments, then overlay the routed arguments.
    fn render_args(
        &self,
        raw: &Map<String, Value>,
        node: &NodeState,
        ctx: &RenderContext,
    ) -> EngineResult<Map<String, Value>> {
        let mut args = match self.renderer.render_value(&Value::Object(raw.clone()), ctx)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (k, v) in &node.args {
            args.insert(k.clone(), v.clone());
        }
        Ok(args)
    }

    /// Template context for a node: execution context, routed arguments
    /// (flattened and under `args`) and element bindings.
    fn node_context(
        &self,
        state: &ExecutionState,
        node: &NodeState,
        bindings: Option<Map<String, Value>>,
    ) -> RenderContext {
        let mut vars = state.build_context();
        let routed = node
            .parent
            .as_deref()
            .and_then(|p| state.node(p))
            .map(|p| &p.args)
            .unwrap_or(&node.args);
        for (k, v) in routed {
            vars.insert(k.clone(), v.clone());
        }
        vars.insert("args".to_string(), Value::Object(routed.clone()));
        if let Some(bindings) = bindings {
            for (k, v) in bindings {
                vars.insert(k, v);
            }
        }
        vars.into_iter().collect()
    }
}

/// Element bindings of an iteration node.
fn bindings_for(node: &NodeState, step: &StepDefinition) -> Option<Map<String, Value>> {
    let spec = step.iterator()?;
    let element = node.element.clone()?;
    let mut bindings = Map::new();
    bindings.insert(spec.element.clone(), element);
    bindings.insert("_index".to_string(), json!(node.index));
    Some(bindings)
}

fn node_scope(state: &ExecutionState, node: &NodeState) -> Scope {
    let scope = Scope::job(state.execution_id).step(&node.step);
    match node.index {
        Some(index) => scope.task(&node.step, Some(index)),
        None => scope,
    }
}

/// Queue the job, or hand it to a child execution for the `playbook` tool.
///
/// The child workload is the tool's `workload` mapping, defaulting to the
/// job's arguments.
fn dispatch(job: Job, generation: i64) -> EngineResult<Command> {
    if job.tool_kind() != Some(PLAYBOOK_TOOL) {
        return Ok(Command::Enqueue(job.into_request()?));
    }
    let reference = job
        .tool
        .get("path")
        .or_else(|| job.tool.get("reference"))
        .and_then(Value::as_str)
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "playbook tool of node '{}' requires a 'path'",
                job.node_id
            ))
        })?
        .to_string();
    let workload = match job.tool.get("workload") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::Null) | None => Value::Object(job.args.clone()),
        Some(other) => {
            return Err(EngineError::Validation(format!(
                "playbook tool workload must be a mapping, got {}",
                other
            )))
        }
    };
    Ok(Command::StartChild(ChildRequest {
        execution_id: job.execution_id,
        node_id: job.node_id,
        generation,
        reference,
        workload,
    }))
}

fn parse_outcome(event: &Event, attempt: u32) -> Outcome {
    match event.field("outcome").cloned().map(serde_json::from_value::<Outcome>) {
        Some(Ok(outcome)) => outcome,
        Some(Err(e)) => Outcome::error(
            ErrorInfo::new(ErrorKind::Validation, format!("malformed outcome: {}", e))
                .with_retryable(false),
        )
        .with_attempt(attempt),
        None => Outcome::error(
            ErrorInfo::new(ErrorKind::Validation, "outcome missing from event")
                .with_retryable(false),
        )
        .with_attempt(attempt),
    }
}

fn scheduled_event(
    state: &ExecutionState,
    step: &str,
    args: Map<String, Value>,
    trigger: i64,
) -> NewEvent {
    NewEvent::new(
        state.execution_id,
        step,
        EventType::StepScheduled,
        EventStatus::Pending,
    )
    .with_context(json!({
        "args": args,
        "trigger_event_id": trigger,
        "scope": Scope::job(state.execution_id).step(step).to_string(),
    }))
    .with_key(format!("scheduled:{}:{}", step, trigger))
}

fn step_completed(
    state: &ExecutionState,
    node: &NodeState,
    result: Value,
    error: Option<Value>,
) -> NewEvent {
    NewEvent::new(
        state.execution_id,
        &node.node_id,
        EventType::StepCompleted,
        EventStatus::Completed,
    )
    .with_context(json!({
        "result": result,
        "error": error,
        "attempt": node.attempt,
        "scope": node_scope(state, node).to_string(),
    }))
    .with_key(format!("completed:{}:{}", node.node_id, node.scheduled_by))
}

fn step_failed(state: &ExecutionState, node: &NodeState, error: Value) -> NewEvent {
    NewEvent::new(
        state.execution_id,
        &node.node_id,
        EventType::StepFailed,
        EventStatus::Failed,
    )
    .with_context(json!({
        "error": error,
        "attempt": node.attempt,
        "scope": node_scope(state, node).to_string(),
    }))
    .with_key(format!("failed:{}:{}", node.node_id, node.scheduled_by))
}

fn playbook_completed(state: &ExecutionState, last_node: &str) -> NewEvent {
    let steps = state
        .build_context()
        .remove("steps")
        .unwrap_or(Value::Null);
    NewEvent::new(
        state.execution_id,
        state.playbook_reference.as_str(),
        EventType::PlaybookCompleted,
        EventStatus::Completed,
    )
    .with_context(json!({"last_step": last_node, "steps": steps}))
    .with_key("playbook_completed")
}

fn playbook_failed(state: &ExecutionState, failed_node: &str, error: Value) -> NewEvent {
    NewEvent::new(
        state.execution_id,
        state.playbook_reference.as_str(),
        EventType::PlaybookFailed,
        EventStatus::Failed,
    )
    .with_context(json!({"failed_step": failed_node, "error": error}))
    .with_key("playbook_failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NodeType;
    use crate::playbook::{normalize_playbook, parse_playbook};
    use chrono::Utc;

    struct Harness {
        orchestrator: WorkflowOrchestrator,
        playbook: NormalizedPlaybook,
        events: Vec<Event>,
    }

    impl Harness {
        fn new(yaml: &str, workload: Value) -> Self {
            let playbook = normalize_playbook(&parse_playbook(yaml).unwrap()).unwrap();
            let mut harness = Self {
                orchestrator: WorkflowOrchestrator::new(),
                playbook,
                events: Vec::new(),
            };
            harness.push(
                NewEvent::new(1, "test", EventType::ExecutionStart, EventStatus::Started)
                    .with_context(json!({"workload": workload, "playbook_reference": "test"})),
            );
            harness
        }

        fn push(&mut self, event: NewEvent) -> Event {
            let id = self.events.len() as i64 + 1;
            let event = event.into_event(id, Utc::now());
            self.events.push(event.clone());
            event
        }

        fn state(&self) -> ExecutionState {
            ExecutionState::from_events(&self.events).unwrap()
        }

        /// React to the last event and append the produced events.
        fn step(&mut self) -> Reaction {
            let event = self.events.last().cloned().unwrap();
            let reaction = self
                .orchestrator
                .react(&self.state(), &self.playbook, &event)
                .unwrap();
            for e in reaction.events().cloned().collect::<Vec<_>>() {
                self.push(e);
            }
            reaction
        }

        fn last(&self) -> &Event {
            self.events.last().unwrap()
        }
    }

    fn enqueued(reaction: &Reaction) -> Vec<Job> {
        reaction
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Enqueue(r) => Some(serde_json::from_value(r.payload.clone()).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn outcome_event(node: &str, attempt: u32, queue_id: i64, outcome: Outcome) -> NewEvent {
        let event_type = if outcome.is_ok() {
            EventType::ActionCompleted
        } else {
            EventType::ActionFailed
        };
        NewEvent::new(1, node, event_type, EventStatus::Completed).with_context(json!({
            "attempt": attempt,
            "queue_id": queue_id,
            "outcome": outcome.with_attempt(attempt),
        }))
    }

    const FETCH: &str = r#"
metadata:
  name: fetch
workflow:
  - step: start
    tool:
      kind: http
      url: "https://api.example.com/{{ workload.region }}/{{ page }}"
    args:
      page: "{{ workload.first_page }}"
    policy:
      - when: "outcome.status == 'error' and outcome.error.http.status == 429"
        then:
          do: retry
          attempts: 2
          backoff: fixed
          delay: 3
    next: done
  - step: done
"#;

    #[test]
    fn test_start_schedules_entry_and_enqueues_rendered_job() {
        let mut h = Harness::new(FETCH, json!({"region": "eu", "first_page": 2}));

        h.step();
        assert_eq!(h.last().event_type, EventType::StepScheduled);
        assert_eq!(h.last().node_name, "start");

        let reaction = h.step();
        let jobs = enqueued(&reaction);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].node_id, "start");
        assert_eq!(jobs[0].node_type(), NodeType::Step);
        assert_eq!(jobs[0].args.get("page"), Some(&json!(2)));
        assert_eq!(jobs[0].tool["url"], "https://api.example.com/eu/2");
    }

    #[test]
    fn test_render_failure_fails_step_and_playbook() {
        let mut h = Harness::new(FETCH, json!({"region": "eu"}));
        h.step();
        let reaction = h.step();
        assert!(enqueued(&reaction).is_empty());
        assert_eq!(h.last().event_type, EventType::StepFailed);
        assert_eq!(h.last().context["error"]["kind"], "template_error");

        h.step();
        assert_eq!(h.last().event_type, EventType::PlaybookFailed);
        assert_eq!(h.state().status, crate::db::models::ExecutionStatus::Failed);

        let reaction = h
            .orchestrator
            .react(&h.state(), &h.playbook, &h.events[2].clone())
            .unwrap();
        assert!(reaction.is_empty());
    }

    #[test]
    fn test_retry_then_exhaust() {
        let mut h = Harness::new(FETCH, json!({"region": "eu", "first_page": 1}));
        h.step();
        h.step();
        h.push(
            NewEvent::new(1, "start", EventType::StepStarted, EventStatus::Running)
                .with_context(json!({"attempt": 1, "queue_id": 5})),
        );
        h.push(outcome_event("start", 1, 5, Outcome::error(ErrorInfo::http(429, "slow"))));

        h.step();
        let retry = h.last().clone();
        assert_eq!(retry.event_type, EventType::StepRetry);
        assert_eq!(retry.context["delay_secs"], 3.0);

        let reaction = h.step();
        assert_eq!(
            reaction.commands,
            vec![Command::Requeue {
                queue_id: 5,
                expected_attempt: 0,
                delay: Duration::from_secs(3),
            }]
        );

        // Reacting to the same outcome again decides nothing new.
        let again = h
            .orchestrator
            .react(&h.state(), &h.playbook, &h.events[3].clone())
            .unwrap();
        assert!(again.is_empty());

        h.push(
            NewEvent::new(1, "start", EventType::StepStarted, EventStatus::Running)
                .with_context(json!({"attempt": 2, "queue_id": 5})),
        );
        h.push(outcome_event("start", 2, 5, Outcome::error(ErrorInfo::http(429, "slow"))));
        h.step();
        assert_eq!(h.last().event_type, EventType::StepFailed);
        assert_eq!(h.last().context["error"]["attempts"], 2);
        assert_eq!(h.last().context["error"]["retries_exhausted"], true);
    }

    #[test]
    fn test_success_routes_and_completes() {
        let mut h = Harness::new(FETCH, json!({"region": "eu", "first_page": 1}));
        h.step();
        h.step();
        h.push(outcome_event("start", 1, 5, Outcome::ok(json!({"rows": 10}))));

        h.step();
        assert_eq!(h.last().event_type, EventType::StepCompleted);
        assert_eq!(h.last().context["result"]["rows"], 10);

        h.step();
        assert_eq!(h.last().event_type, EventType::StepScheduled);
        assert_eq!(h.last().node_name, "done");

        h.step();
        assert_eq!(h.last().event_type, EventType::StepCompleted);
        h.step();
        assert_eq!(h.last().event_type, EventType::PlaybookCompleted);
        assert_eq!(h.last().context["steps"]["start"]["rows"], 10);
    }

    #[test]
    fn test_playbook_tool_starts_child() {
        let yaml = r#"
metadata:
  name: parent
workflow:
  - step: nested
    tool:
      kind: playbook
      path: per_region
      workload:
        region: "{{ workload.region }}"
    next: bare
  - step: bare
    tool:
      kind: playbook
"#;
        let mut h = Harness::new(yaml, json!({"region": "eu"}));
        h.step();
        let scheduled = h.last().event_id;
        let reaction = h.step();
        assert!(enqueued(&reaction).is_empty());
        assert_eq!(
            reaction.commands,
            vec![Command::StartChild(ChildRequest {
                execution_id: 1,
                node_id: "nested".to_string(),
                generation: scheduled,
                reference: "per_region".to_string(),
                workload: json!({"region": "eu"}),
            })]
        );

        h.push(
            NewEvent::new(1, "nested", EventType::StepStarted, EventStatus::Running)
                .with_context(json!({"attempt": 1, "generation": scheduled})),
        );
        h.push(
            NewEvent::new(1, "nested", EventType::ActionCompleted, EventStatus::Completed)
                .with_context(json!({
                    "attempt": 1,
                    "generation": scheduled,
                    "outcome": Outcome::ok(json!({"execution_id": 9})),
                })),
        );
        h.step();
        assert_eq!(h.last().event_type, EventType::StepCompleted);
        assert_eq!(h.last().context["result"]["execution_id"], 9);

        h.step();
        assert_eq!(h.last().node_name, "bare");
        h.step();
        assert_eq!(h.last().event_type, EventType::StepFailed);
        assert_eq!(h.last().context["error"]["kind"], "validation_error");
    }

    #[test]
    fn test_empty_iterator_completes_immediately() {
        let yaml = r#"
metadata:
  name: empty
workflow:
  - step: fan
    collection: "{{ workload.items }}"
    element: item
    task:
      tool: noop
"#;
        let mut h = Harness::new(yaml, json!({"items": []}));
        h.step();
        let reaction = h.step();
        let types: Vec<EventType> = reaction.events().map(|e| e.event_type.clone()).collect();
        assert_eq!(types, vec![EventType::IteratorStarted, EventType::StepCompleted]);
        assert_eq!(h.last().context["result"], json!([]));

        h.step();
        assert_eq!(h.last().event_type, EventType::PlaybookCompleted);
    }

    #[test]
    fn test_sequential_iterator_enqueues_one_at_a_time() {
        let yaml = r#"
metadata:
  name: seq
workflow:
  - step: fan
    loop:
      in: "{{ workload.items }}"
      iterator: city
    tool:
      kind: noop
      result: "{{ city }}"
"#;
        let mut h = Harness::new(yaml, json!({"items": ["oslo", "rome"]}));
        h.step();
        h.step();
        assert_eq!(h.last().event_type, EventType::IteratorStarted);

        let jobs = enqueued(&h.step());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].node_id, "fan[0]");
        assert_eq!(jobs[0].tool["result"], "oslo");

        h.push(outcome_event("fan[0]", 1, 1, Outcome::ok(json!("oslo"))));
        h.step();
        let jobs = enqueued(&h.step());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].node_id, "fan[1]");
        assert_eq!(jobs[0].index, Some(1));
    }
}
