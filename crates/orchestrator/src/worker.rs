//! Queue worker.
//!
//! A worker is a poll loop over the queue: lease an item, record that it
//! started, run its tool through the injected [`ToolRegistry`] while a
//! background task keeps the lease alive, record the outcome and finish the
//! item. Workers never talk to each other; the queue's lease is the only
//! coordination between them.

use std::sync::Arc;
use std::time::Duration;

use noetl_tools::{ErrorInfo, ErrorKind, ExecutionContext, Outcome, ToolConfig, ToolRegistry};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::db::models::{EventStatus, EventType, NewEvent, QueueItem};
use crate::engine::{Job, Scope};
use crate::error::{EngineError, EngineResult};
use crate::services::{EventLog, QueueManager};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What happened to one leased item.
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub queue_id: i64,
    pub node_id: String,
    pub attempt: u32,
    pub outcome: Outcome,
    /// Whether the outcome was recorded. `false` when the lease was lost
    /// while the tool ran.
    pub recorded: bool,
}

/// Worker that executes queued jobs.
pub struct Worker {
    id: String,
    queue: Arc<dyn QueueManager>,
    events: Arc<dyn EventLog>,
    registry: Arc<ToolRegistry>,
    lease_timeout: Duration,
    heartbeat_interval: Duration,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn QueueManager>,
        events: Arc<dyn EventLog>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let config = OrchestratorConfig::default();
        Self {
            id: id.into(),
            queue,
            events,
            registry,
            lease_timeout: config.lease_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Take lease, heartbeat and poll timing from configuration.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.lease_timeout = config.lease_timeout();
        self.heartbeat_interval = config.heartbeat_interval();
        self.poll_interval = config.poll_interval();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lease and run one item. Returns `None` when nothing is eligible.
    ///
    /// # Errors
    ///
    /// Store failures propagate; the item then stays leased until its lease
    /// expires and the queue hands it out again.
    pub async fn run_once(&self) -> EngineResult<Option<JobReport>> {
        let Some(item) = self.queue.lease(&self.id, self.lease_timeout).await? else {
            return Ok(None);
        };
        let attempt = item.attempt();
        let job = serde_json::from_value::<Job>(item.payload.clone());
        let scope = job_scope(&item, job.as_ref().ok());

        tracing::info!(
            worker_id = %self.id,
            queue_id = item.queue_id,
            execution_id = item.execution_id,
            node_id = %item.node_id,
            attempt,
            "Job leased"
        );

        self.events
            .append(
                NewEvent::new(
                    item.execution_id,
                    item.node_id.as_str(),
                    EventType::StepStarted,
                    EventStatus::Running,
                )
                .with_context(json!({
                    "attempt": attempt,
                    "queue_id": item.queue_id,
                    "worker_id": self.id,
                    "scope": scope.to_string(),
                }))
                .with_key(format!("started:{}:{}", item.queue_id, attempt)),
            )
            .await?;

        let heartbeat = self.spawn_heartbeat(item.queue_id);
        let outcome = match job {
            Ok(job) => self.execute(&item, &job, attempt, &scope).await,
            Err(e) => Outcome::error(
                ErrorInfo::new(ErrorKind::Validation, format!("Malformed job payload: {}", e))
                    .with_retryable(false),
            ),
        }
        .with_attempt(attempt);
        heartbeat.abort();

        if !self
            .queue
            .heartbeat(item.queue_id, &self.id, self.lease_timeout)
            .await?
        {
            let conflict = EngineError::LeaseConflict {
                queue_id: item.queue_id,
                worker_id: self.id.clone(),
            };
            tracing::warn!(error = %conflict, node_id = %item.node_id, "Lease lost, dropping outcome");
            return Ok(Some(JobReport {
                queue_id: item.queue_id,
                node_id: item.node_id,
                attempt,
                outcome,
                recorded: false,
            }));
        }

        let event_type = if outcome.is_ok() {
            EventType::ActionCompleted
        } else {
            EventType::ActionFailed
        };
        self.events
            .append(
                NewEvent::new(
                    item.execution_id,
                    item.node_id.as_str(),
                    event_type,
                    EventStatus::Completed,
                )
                .with_context(json!({
                    "attempt": attempt,
                    "queue_id": item.queue_id,
                    "worker_id": self.id,
                    "outcome": outcome,
                    "scope": scope.to_string(),
                }))
                .with_key(format!("outcome:{}:{}", item.queue_id, attempt)),
            )
            .await?;

        let finished = if outcome.is_ok() {
            let result = outcome.result.clone().unwrap_or(Value::Null);
            self.queue.complete(item.queue_id, &self.id, &result).await
        } else {
            let error = serde_json::to_value(&outcome.error)?;
            self.queue.fail(item.queue_id, &self.id, &error).await
        };
        match finished {
            Ok(completion) => tracing::debug!(
                queue_id = item.queue_id,
                status = %outcome.status,
                ?completion,
                "Job finished"
            ),
            Err(e @ EngineError::LeaseConflict { .. }) => {
                tracing::warn!(error = %e, "Queue item taken over before it was finished")
            }
            Err(e) => return Err(e),
        }

        Ok(Some(JobReport {
            queue_id: item.queue_id,
            node_id: item.node_id,
            attempt,
            outcome,
            recorded: true,
        }))
    }

    /// Poll until `shutdown` flips. Idle polls sleep `poll_interval`; store
    /// failures back off exponentially.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, "Worker started");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(Some(_)) => {
                    failures = 0;
                    continue;
                }
                Ok(None) => {
                    failures = 0;
                    self.poll_interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = backoff(self.poll_interval, failures);
                    tracing::error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = pause.as_millis() as u64,
                        "Worker poll failed"
                    );
                    pause
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    async fn execute(&self, item: &QueueItem, job: &Job, attempt: u32, scope: &Scope) -> Outcome {
        let config = match serde_json::from_value::<ToolConfig>(job.tool.clone()) {
            Ok(config) => config,
            Err(e) => {
                return Outcome::error(
                    ErrorInfo::new(ErrorKind::Configuration, format!("Invalid tool: {}", e))
                        .with_retryable(false),
                )
            }
        };

        let mut ctx = ExecutionContext::new(item.execution_id, &item.node_id, &job.step)
            .with_variables(job.variables.clone());
        ctx.queue_id = item.queue_id;
        ctx.attempt = attempt;
        ctx.worker_id = self.id.clone();
        ctx.scope = scope.to_string();

        self.registry.execute(&config.kind, &config, &ctx).await
    }

    fn spawn_heartbeat(&self, queue_id: i64) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.id.clone();
        let interval = self.heartbeat_interval;
        let extension = self.lease_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate

            loop {
                ticker.tick().await;
                match queue.heartbeat(queue_id, &worker_id, extension).await {
                    Ok(true) => tracing::trace!(queue_id, "Lease extended"),
                    Ok(false) => {
                        tracing::warn!(queue_id, worker_id = %worker_id, "Lease no longer held");
                        break;
                    }
                    Err(e) => tracing::warn!(queue_id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }
}

fn job_scope(item: &QueueItem, job: Option<&Job>) -> Scope {
    let Some(job) = job else {
        return Scope::job(item.execution_id).step(&item.node_id);
    };
    let mut scope = Scope::job(item.execution_id).step(&job.step);
    if let Some(index) = job.index {
        scope = scope.task(&job.step, Some(index));
    }
    match job.tool_kind() {
        Some(kind) => scope.action(kind),
        None => scope,
    }
}

fn backoff(base: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EnqueueRequest, NewExecution, NodeType};
    use crate::services::InMemoryStore;
    use async_trait::async_trait;
    use noetl_tools::{Tool, ToolError};
    use serde_json::Map;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn execute(
            &self,
            config: &ToolConfig,
            ctx: &ExecutionContext,
        ) -> Result<Value, ToolError> {
            match config.get("fail") {
                Some(Value::Bool(true)) => Err(ToolError::Http {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
                _ => Ok(json!({"node": ctx.node_id, "attempt": ctx.attempt})),
            }
        }
    }

    async fn setup(tool: Value) -> (Worker, Arc<InMemoryStore>, i64) {
        let store = Arc::new(InMemoryStore::new());
        let execution_id = store
            .create_execution(&NewExecution::new("demo", json!({})))
            .await
            .unwrap();
        let job = Job {
            execution_id,
            node_id: "fetch".to_string(),
            step: "fetch".to_string(),
            index: None,
            tool,
            args: Map::new(),
            variables: Map::new(),
        };
        store.enqueue(&job.into_request().unwrap()).await.unwrap();

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let worker = Worker::new("w-1", store.clone(), store.clone(), Arc::new(registry));
        (worker, store, execution_id)
    }

    #[tokio::test]
    async fn test_run_once_idle() {
        let store = Arc::new(InMemoryStore::new());
        let worker = Worker::new(
            "w-1",
            store.clone(),
            store,
            Arc::new(ToolRegistry::new()),
        );
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_once_records_started_and_outcome() {
        let (worker, store, execution_id) = setup(json!({"kind": "echo"})).await;

        let report = worker.run_once().await.unwrap().unwrap();
        assert!(report.recorded);
        assert!(report.outcome.is_ok());
        assert_eq!(report.outcome.result, Some(json!({"node": "fetch", "attempt": 1})));

        let events = store.read(execution_id, 0).await.unwrap();
        let types: Vec<&EventType> = events.iter().map(|e| &e.event_type).collect();
        assert_eq!(types, vec![&EventType::StepStarted, &EventType::ActionCompleted]);
        assert_eq!(events[1].context["outcome"]["meta"]["tool"], "echo");
        assert_eq!(events[1].context["scope"], format!("job:{}/step:fetch/action:echo", execution_id));

        let item = store.get(report.queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, crate::db::models::QueueStatus::Completed);
    }

    #[tokio::test]
    async fn test_tool_error_fails_item() {
        let (worker, store, execution_id) = setup(json!({"kind": "echo", "fail": true})).await;

        let report = worker.run_once().await.unwrap().unwrap();
        let error = report.outcome.error.clone().unwrap();
        assert_eq!(error.http_status(), Some(503));
        assert!(error.retryable);

        let events = store.read(execution_id, 0).await.unwrap();
        assert_eq!(events[1].event_type, EventType::ActionFailed);
        let item = store.get(report.queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, crate::db::models::QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_an_error_outcome() {
        let store = Arc::new(InMemoryStore::new());
        let execution_id = store
            .create_execution(&NewExecution::new("demo", json!({})))
            .await
            .unwrap();
        store
            .enqueue(&EnqueueRequest {
                execution_id,
                node_id: "broken".to_string(),
                node_type: NodeType::Step,
                payload: json!({"nonsense": true}),
            })
            .await
            .unwrap();
        let worker = Worker::new("w-1", store.clone(), store.clone(), Arc::new(ToolRegistry::new()));

        let report = worker.run_once().await.unwrap().unwrap();
        let error = report.outcome.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(!error.retryable);
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 1), base);
        assert_eq!(backoff(base, 3), Duration::from_secs(2));
        assert_eq!(backoff(base, 40), MAX_BACKOFF);
    }
}
