//! Execution driver.
//!
//! Owns submission and the orchestration loop. Each pass replays an
//! execution's log, hands every event past this instance's cursor to the
//! [`WorkflowOrchestrator`] together with the current folded state, and
//! applies the resulting commands. Reacting to an event twice is harmless,
//! so cursors live in memory and several instances may drive the same
//! execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use noetl_tools::{ErrorInfo, ErrorKind, Outcome};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::db::models::{
    EnqueueRequest, Event, EventStatus, EventType, Execution, NewEvent, NewExecution,
};
use crate::engine::{
    ChildRequest, Command, ExecutionState, NodeStatus, Reaction, WorkflowOrchestrator,
};
use crate::error::{EngineError, EngineResult};
use crate::playbook::{normalize_playbook, NormalizedPlaybook, PLAYBOOK_TOOL};
use crate::result_ext::ResultExt;

use super::catalog::PlaybookCatalog;
use super::event::EventLog;
use super::queue::QueueManager;

/// Drives executions from submission to a terminal event.
pub struct ExecutionService {
    events: Arc<dyn EventLog>,
    queue: Arc<dyn QueueManager>,
    catalog: Arc<dyn PlaybookCatalog>,
    orchestrator: WorkflowOrchestrator,
    /// Last event reacted to, per execution.
    cursors: Mutex<HashMap<i64, i64>>,
    /// Enqueues rejected while an earlier item for the node was still active.
    deferred: Mutex<HashMap<i64, Vec<EnqueueRequest>>>,
    playbooks: RwLock<HashMap<i64, Arc<NormalizedPlaybook>>>,
}

impl ExecutionService {
    pub fn new(
        events: Arc<dyn EventLog>,
        queue: Arc<dyn QueueManager>,
        catalog: Arc<dyn PlaybookCatalog>,
    ) -> Self {
        Self {
            events,
            queue,
            catalog,
            orchestrator: WorkflowOrchestrator::new(),
            cursors: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            playbooks: RwLock::new(HashMap::new()),
        }
    }

    /// Start a new execution of `reference`.
    ///
    /// # Errors
    ///
    /// Resolution and validation failures are returned before anything is
    /// stored.
    pub async fn submit(&self, reference: &str, workload: Value) -> EngineResult<i64> {
        self.start(NewExecution::new(reference, workload)).await
    }

    /// Start an execution spawned by `parent_execution_id`.
    pub async fn submit_child(
        &self,
        reference: &str,
        workload: Value,
        parent_execution_id: i64,
    ) -> EngineResult<i64> {
        self.start(NewExecution::new(reference, workload).with_parent(parent_execution_id))
            .await
    }

    async fn start(&self, request: NewExecution) -> EngineResult<i64> {
        let execution_id = self.create(request, None).await?;
        self.process(execution_id).await?;
        Ok(execution_id)
    }

    /// Store the execution and its start event. `parent_node` names the
    /// node of the parent execution that waits on it.
    async fn create(
        &self,
        mut request: NewExecution,
        parent_node: Option<&ChildRequest>,
    ) -> EngineResult<i64> {
        let playbook = self.catalog.resolve(&request.playbook_reference).await?;
        let normalized = Arc::new(normalize_playbook(&playbook)?);
        request.workload = merge_workload(&normalized.workload, request.workload);

        let execution_id = self.events.create_execution(&request).await?;
        self.events
            .append(
                NewEvent::new(
                    execution_id,
                    request.playbook_reference.as_str(),
                    EventType::ExecutionStart,
                    EventStatus::Started,
                )
                .with_context(json!({
                    "playbook_reference": request.playbook_reference,
                    "workload": request.workload,
                    "parent_execution_id": request.parent_execution_id,
                    "parent_node_id": parent_node.map(|p| p.node_id.as_str()),
                    "parent_generation": parent_node.map(|p| p.generation),
                }))
                .with_key("execution_start"),
            )
            .await?;

        self.playbooks
            .write()
            .await
            .insert(execution_id, normalized);

        info!(
            execution_id,
            playbook = %request.playbook_reference,
            parent_execution_id = ?request.parent_execution_id,
            "Execution submitted"
        );
        Ok(execution_id)
    }

    /// React to every event of the execution not yet handled by this
    /// instance, until no new events appear. Returns the number of events
    /// handled.
    pub async fn process(&self, execution_id: i64) -> EngineResult<usize> {
        let mut events = self.events.read(execution_id, 0).await?;
        let mut state = ExecutionState::from_events(&events).ok_or_else(|| {
            EngineError::NotFound(format!("Execution {} has no events", execution_id))
        })?;
        if state.status.is_terminal() {
            self.finish(&state, &events).await?;
            return Ok(0);
        }

        let playbook = self.playbook_for(execution_id).await?;
        let mut seen = events.last().map(|e| e.event_id).unwrap_or(0);
        let mut cursor = self.cursors.lock().await.get(&execution_id).copied().unwrap_or(0);

        self.retry_deferred(execution_id, &state).await?;

        let mut handled = 0;
        while let Some(event) = events.iter().find(|e| e.event_id > cursor).cloned() {
            let reaction = self.orchestrator.react(&state, &playbook, &event)?;
            self.apply(execution_id, reaction).await?;

            cursor = event.event_id;
            self.cursors.lock().await.insert(execution_id, cursor);
            handled += 1;

            let fresh = self.events.read(execution_id, seen).await?;
            for new_event in &fresh {
                state.apply_event(new_event);
                seen = seen.max(new_event.event_id);
            }
            events.extend(fresh);
        }

        if state.status.is_terminal() {
            self.finish(&state, &events).await?;
        }
        if handled > 0 {
            debug!(execution_id, handled, cursor, status = %state.status, "Execution processed");
        }
        Ok(handled)
    }

    /// Process every running execution.
    ///
    /// # Errors
    ///
    /// Store failures abort the sweep; other per-execution failures are
    /// logged and the sweep continues.
    pub async fn process_running(&self) -> EngineResult<usize> {
        let mut handled = 0;
        for execution_id in self.events.running_executions().await? {
            match self.process(execution_id).await {
                Ok(n) => handled += n,
                Err(e) if e.is_store_error() => return Err(e),
                Err(e) => warn!(execution_id, error = %e, "Failed to process execution"),
            }
        }
        Ok(handled)
    }

    /// Sweep running executions every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "Orchestrator loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.process_running().await.log("orchestrator sweep");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Orchestrator loop stopped");
    }

    /// Current state of an execution, folded from its log.
    pub async fn state(&self, execution_id: i64) -> EngineResult<ExecutionState> {
        self.events.replay(execution_id).await
    }

    pub async fn execution(&self, execution_id: i64) -> EngineResult<Execution> {
        self.events
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Execution {} not found", execution_id)))
    }

    pub async fn events(&self, execution_id: i64) -> EngineResult<Vec<Event>> {
        self.events.read(execution_id, 0).await
    }

    async fn apply(&self, execution_id: i64, reaction: Reaction) -> EngineResult<()> {
        for command in reaction.commands {
            match command {
                Command::Append(event) => {
                    self.events.append(event).await?;
                }
                Command::Enqueue(request) => match self.queue.enqueue(&request).await {
                    Ok(queue_id) => {
                        debug!(execution_id, queue_id, node_id = %request.node_id, "Node enqueued")
                    }
                    Err(EngineError::DuplicateEnqueue { node_id, .. }) => {
                        debug!(execution_id, node_id = %node_id, "Node already queued, deferring");
                        self.deferred
                            .lock()
                            .await
                            .entry(execution_id)
                            .or_default()
                            .push(request);
                    }
                    Err(e) => return Err(e),
                },
                Command::Requeue {
                    queue_id,
                    expected_attempt,
                    delay,
                } => {
                    let applied = self.queue.requeue(queue_id, expected_attempt, delay).await?;
                    if applied {
                        debug!(execution_id, queue_id, delay_ms = delay.as_millis() as u64, "Item requeued");
                    } else {
                        debug!(execution_id, queue_id, expected_attempt, "Requeue already applied");
                    }
                }
                Command::StartChild(request) => self.start_child(request).await?,
            }
        }
        Ok(())
    }

    /// Retry deferred enqueues whose node is still waiting to be picked up.
    async fn retry_deferred(&self, execution_id: i64, state: &ExecutionState) -> EngineResult<()> {
        let pending = match self.deferred.lock().await.remove(&execution_id) {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let mut still_blocked = Vec::new();
        for request in pending {
            let waiting = state
                .node(&request.node_id)
                .map(|n| n.status == NodeStatus::Scheduled)
                .unwrap_or(false);
            if !waiting || state.status.is_terminal() {
                continue;
            }
            match self.queue.enqueue(&request).await {
                Ok(queue_id) => {
                    debug!(execution_id, queue_id, node_id = %request.node_id, "Deferred node enqueued")
                }
                Err(EngineError::DuplicateEnqueue { .. }) => still_blocked.push(request),
                Err(e) => return Err(e),
            }
        }

        if !still_blocked.is_empty() {
            self.deferred
                .lock()
                .await
                .entry(execution_id)
                .or_default()
                .extend(still_blocked);
        }
        Ok(())
    }

    async fn playbook_for(&self, execution_id: i64) -> EngineResult<Arc<NormalizedPlaybook>> {
        if let Some(playbook) = self.playbooks.read().await.get(&execution_id) {
            return Ok(playbook.clone());
        }

        let execution = self.execution(execution_id).await?;
        let playbook = self.catalog.resolve(&execution.playbook_reference).await?;
        let normalized = Arc::new(normalize_playbook(&playbook)?);
        self.playbooks
            .write()
            .await
            .insert(execution_id, normalized.clone());
        Ok(normalized)
    }

    /// Claim the node, then start its child execution. Whoever appends the
    /// claim first starts the child; a child that cannot be started is
    /// reported as the node's failed outcome.
    async fn start_child(&self, request: ChildRequest) -> EngineResult<()> {
        let claim = self
            .events
            .append(
                NewEvent::new(
                    request.execution_id,
                    &request.node_id,
                    EventType::StepStarted,
                    EventStatus::Running,
                )
                .with_context(json!({
                    "attempt": 1,
                    "generation": request.generation,
                    "playbook_reference": request.reference,
                }))
                .with_key(format!("child:{}:{}", request.node_id, request.generation)),
            )
            .await?;
        if !claim.is_new() {
            debug!(execution_id = request.execution_id, node_id = %request.node_id, "Child already started");
            return Ok(());
        }

        let child = NewExecution::new(request.reference.as_str(), request.workload.clone())
            .with_parent(request.execution_id);
        match self.create(child, Some(&request)).await {
            Ok(child_id) => {
                info!(
                    execution_id = request.execution_id,
                    node_id = %request.node_id,
                    child_execution_id = child_id,
                    "Child execution started"
                );
                Ok(())
            }
            Err(e) if e.is_store_error() => Err(e),
            Err(e) => {
                warn!(
                    execution_id = request.execution_id,
                    node_id = %request.node_id,
                    error = %e,
                    "Child execution could not start"
                );
                let outcome = Outcome::error(
                    ErrorInfo::new(ErrorKind::Validation, e.to_string()).with_retryable(false),
                );
                self.report_outcome(
                    request.execution_id,
                    &request.node_id,
                    request.generation,
                    outcome,
                    None,
                )
                .await
            }
        }
    }

    /// Hand a terminal execution's result to the parent node waiting on it,
    /// then drop what this instance holds for it.
    async fn finish(&self, state: &ExecutionState, events: &[Event]) -> EngineResult<()> {
        if let (Some(parent_id), Some(node_id), Some(generation)) = (
            state.parent_execution_id,
            state.parent_node_id.as_deref(),
            state.parent_generation,
        ) {
            let terminal = events.iter().find(|e| e.event_type.is_terminal());
            let outcome = match terminal {
                Some(event) if event.event_type == EventType::PlaybookCompleted => {
                    Outcome::ok(json!({
                        "execution_id": state.execution_id,
                        "last_step": event.field("last_step").cloned().unwrap_or(Value::Null),
                        "steps": event.field("steps").cloned().unwrap_or(Value::Null),
                    }))
                }
                _ => {
                    let failed_step = terminal
                        .and_then(|e| e.field("failed_step"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    Outcome::error(
                        ErrorInfo::new(
                            ErrorKind::Execution,
                            format!(
                                "child execution {} failed at '{}'",
                                state.execution_id, failed_step
                            ),
                        )
                        .with_retryable(false),
                    )
                }
            };
            self.report_outcome(parent_id, node_id, generation, outcome, Some(state.execution_id))
                .await?;
        }
        self.forget(state.execution_id).await;
        Ok(())
    }

    /// Append a child's outcome to the parent's log as the node's action event.
    async fn report_outcome(
        &self,
        execution_id: i64,
        node_id: &str,
        generation: i64,
        outcome: Outcome,
        child_execution_id: Option<i64>,
    ) -> EngineResult<()> {
        let (event_type, status) = if outcome.is_ok() {
            (EventType::ActionCompleted, EventStatus::Completed)
        } else {
            (EventType::ActionFailed, EventStatus::Failed)
        };
        let outcome = outcome.with_attempt(1).with_tool(PLAYBOOK_TOOL);
        let appended = self
            .events
            .append(
                NewEvent::new(execution_id, node_id, event_type, status)
                    .with_context(json!({
                        "attempt": 1,
                        "generation": generation,
                        "child_execution_id": child_execution_id,
                        "outcome": outcome,
                    }))
                    .with_key(format!("outcome:child:{}:{}", node_id, generation)),
            )
            .await?;
        if appended.is_new() {
            debug!(execution_id, node_id, child_execution_id = ?child_execution_id, "Child outcome reported");
        }
        Ok(())
    }

    async fn forget(&self, execution_id: i64) {
        self.playbooks.write().await.remove(&execution_id);
        self.deferred.lock().await.remove(&execution_id);
        self.cursors.lock().await.remove(&execution_id);
    }
}

/// Submitted workload keys override the playbook's defaults.
fn merge_workload(defaults: &Value, submitted: Value) -> Value {
    match (defaults, submitted) {
        (Value::Object(defaults), Value::Object(submitted)) => {
            let mut merged = defaults.clone();
            merged.extend(submitted);
            Value::Object(merged)
        }
        (defaults, Value::Null) => defaults.clone(),
        (_, submitted) => submitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExecutionStatus;
    use crate::services::{InMemoryCatalog, InMemoryStore};
    use crate::worker::Worker;
    use noetl_tools::tools::create_default_registry;

    #[tokio::test]
    async fn test_terminal_execution_releases_bookkeeping() {
        let store = Arc::new(InMemoryStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let reference = catalog
            .register_yaml(
                r#"
metadata:
  name: once
workflow:
  - step: only
    tool: noop
"#,
            )
            .await
            .unwrap();
        let service = ExecutionService::new(store.clone(), store.clone(), catalog);
        let id = service.submit(&reference, json!({})).await.unwrap();
        assert!(service.cursors.lock().await.contains_key(&id));
        assert!(service.playbooks.read().await.contains_key(&id));

        let worker = Worker::new(
            "w-1",
            store.clone(),
            store.clone(),
            Arc::new(create_default_registry()),
        );
        worker.run_once().await.unwrap().unwrap();
        service.process(id).await.unwrap();
        assert_eq!(service.state(id).await.unwrap().status, ExecutionStatus::Completed);

        assert!(service.cursors.lock().await.is_empty());
        assert!(service.playbooks.read().await.is_empty());
        assert!(service.deferred.lock().await.is_empty());

        assert_eq!(service.process(id).await.unwrap(), 0);
        assert!(service.cursors.lock().await.is_empty());
        assert!(service.playbooks.read().await.is_empty());
    }

    #[test]
    fn test_merge_workload() {
        let defaults = json!({"region": "eu", "limit": 10});
        assert_eq!(
            merge_workload(&defaults, json!({"limit": 5})),
            json!({"region": "eu", "limit": 5})
        );
        assert_eq!(merge_workload(&defaults, Value::Null), defaults);
        assert_eq!(merge_workload(&json!({}), json!([1])), json!([1]));
    }
}
