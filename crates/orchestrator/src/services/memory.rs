//! In-memory store.
//!
//! Same contracts as [`PgStore`](super::PgStore) behind one `RwLock`, with an
//! injectable [`Clock`] so lease expiry and retry delays can be simulated.
//! Used by tests and by single-process runs that do not need durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::db::models::{
    Completion, EnqueueRequest, Event, Execution, ExecutionStatus, NewEvent, NewExecution,
    QueueItem, QueueStatus,
};
use crate::error::{EngineError, EngineResult};

use super::event::{terminal_status, Appended, EventLog};
use super::queue::{check_completion, QueueManager};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = to_chrono(by);
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Durations beyond a century are clamped.
fn to_chrono(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration).map(|d| d.min(cap)).unwrap_or(cap)
}

#[derive(Default)]
struct Inner {
    executions: BTreeMap<i64, Execution>,
    events: HashMap<i64, Vec<Event>>,
    keys: HashMap<(i64, String), i64>,
    queue: BTreeMap<i64, QueueItem>,
    next_execution_id: i64,
    next_queue_id: i64,
}

/// Event log and queue manager held in process memory.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock,
        }
    }

    /// Every queue item, in id order.
    pub async fn queue_items(&self) -> Vec<QueueItem> {
        self.inner.read().await.queue.values().cloned().collect()
    }
}

#[async_trait]
impl EventLog for InMemoryStore {
    async fn create_execution(&self, execution: &NewExecution) -> EngineResult<i64> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        inner.next_execution_id += 1;
        let execution_id = inner.next_execution_id;
        inner.executions.insert(
            execution_id,
            Execution {
                execution_id,
                playbook_reference: execution.playbook_reference.clone(),
                workload: execution.workload.clone(),
                status: ExecutionStatus::Running,
                parent_execution_id: execution.parent_execution_id,
                last_event_id: 0,
                created_at: now,
                updated_at: now,
            },
        );
        inner.events.insert(execution_id, Vec::new());
        Ok(execution_id)
    }

    async fn get_execution(&self, execution_id: i64) -> EngineResult<Option<Execution>> {
        Ok(self.inner.read().await.executions.get(&execution_id).cloned())
    }

    async fn running_executions(&self) -> EngineResult<Vec<i64>> {
        Ok(self
            .inner
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .map(|e| e.execution_id)
            .collect())
    }

    async fn append(&self, event: NewEvent) -> EngineResult<Appended> {
        let now = self.clock.now();
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let execution = inner.executions.get_mut(&event.execution_id).ok_or_else(|| {
            EngineError::NotFound(format!("Execution {} not found", event.execution_id))
        })?;

        if let Some(key) = &event.idempotency_key {
            if let Some(existing) = inner.keys.get(&(event.execution_id, key.clone())) {
                return Ok(Appended::Existing(*existing));
            }
        }

        let event_id = execution.last_event_id + 1;
        execution.last_event_id = event_id;
        execution.updated_at = now;
        if let Some(status) = terminal_status(&event.event_type) {
            if execution.status == ExecutionStatus::Running {
                execution.status = status;
            }
        }

        if let Some(key) = &event.idempotency_key {
            inner.keys.insert((event.execution_id, key.clone()), event_id);
        }
        inner
            .events
            .entry(event.execution_id)
            .or_default()
            .push(event.into_event(event_id, now));

        Ok(Appended::Recorded(event_id))
    }

    async fn read(&self, execution_id: i64, after: i64) -> EngineResult<Vec<Event>> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .get(&execution_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl QueueManager for InMemoryStore {
    async fn enqueue(&self, request: &EnqueueRequest) -> EngineResult<i64> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        let active = inner.queue.values().any(|item| {
            item.execution_id == request.execution_id
                && item.node_id == request.node_id
                && !item.status.is_terminal()
        });
        if active {
            return Err(EngineError::DuplicateEnqueue {
                execution_id: request.execution_id,
                node_id: request.node_id.clone(),
            });
        }

        inner.next_queue_id += 1;
        let queue_id = inner.next_queue_id;
        inner.queue.insert(
            queue_id,
            QueueItem {
                queue_id,
                execution_id: request.execution_id,
                node_id: request.node_id.clone(),
                node_type: request.node_type,
                payload: request.payload.clone(),
                status: QueueStatus::Queued,
                lease_owner: None,
                lease_expires_at: None,
                attempt_count: 0,
                available_at: now,
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(queue_id)
    }

    async fn lease(&self, worker_id: &str, timeout: Duration) -> EngineResult<Option<QueueItem>> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        let mut reclaimed = 0u64;
        for item in inner.queue.values_mut() {
            let expired = item.status == QueueStatus::Leased
                && item.lease_expires_at.map(|t| t < now).unwrap_or(true);
            if expired {
                item.status = QueueStatus::Queued;
                item.attempt_count += 1;
                item.lease_owner = None;
                item.lease_expires_at = None;
                item.available_at = now;
                item.updated_at = now;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::info!(reclaimed, "Reclaimed expired leases");
        }

        let claimed = inner
            .queue
            .values_mut()
            .find(|item| item.status == QueueStatus::Queued && item.available_at <= now)
            .map(|item| {
                item.status = QueueStatus::Leased;
                item.lease_owner = Some(worker_id.to_string());
                item.lease_expires_at = Some(now + to_chrono(timeout));
                item.updated_at = now;
                item.clone()
            });
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        extension: Duration,
    ) -> EngineResult<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        match inner.queue.get_mut(&queue_id) {
            Some(item) if item.is_leased_by(worker_id, now) => {
                item.lease_expires_at = Some(now + to_chrono(extension));
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        queue_id: i64,
        worker_id: &str,
        result: &Value,
    ) -> EngineResult<Completion> {
        self.finish(queue_id, worker_id, QueueStatus::Completed, Some(result), None)
            .await
    }

    async fn fail(&self, queue_id: i64, worker_id: &str, error: &Value) -> EngineResult<Completion> {
        self.finish(queue_id, worker_id, QueueStatus::Failed, None, Some(error))
            .await
    }

    async fn requeue(
        &self,
        queue_id: i64,
        expected_attempt: i32,
        delay: Duration,
    ) -> EngineResult<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        match inner.queue.get_mut(&queue_id) {
            Some(item)
                if item.attempt_count == expected_attempt
                    && matches!(item.status, QueueStatus::Leased | QueueStatus::Failed) =>
            {
                item.status = QueueStatus::Queued;
                item.attempt_count += 1;
                item.lease_owner = None;
                item.lease_expires_at = None;
                item.available_at = now + to_chrono(delay);
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, queue_id: i64) -> EngineResult<Option<QueueItem>> {
        Ok(self.inner.read().await.queue.get(&queue_id).cloned())
    }
}

impl InMemoryStore {
    async fn finish(
        &self,
        queue_id: i64,
        worker_id: &str,
        status: QueueStatus,
        result: Option<&Value>,
        error: Option<&Value>,
    ) -> EngineResult<Completion> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let item = inner
            .queue
            .get_mut(&queue_id)
            .ok_or_else(|| EngineError::NotFound(format!("Queue item {} not found", queue_id)))?;

        if let Some(completion) = check_completion(item, worker_id)? {
            return Ok(completion);
        }

        item.status = status;
        item.result = result.cloned();
        item.error = error.cloned();
        item.lease_expires_at = None;
        item.updated_at = now;
        Ok(Completion::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventStatus, EventType, NodeType};
    use serde_json::json;

    fn request(node_id: &str) -> EnqueueRequest {
        EnqueueRequest {
            execution_id: 1,
            node_id: node_id.to_string(),
            node_type: NodeType::Step,
            payload: json!({}),
        }
    }

    fn store_with_clock() -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let store = InMemoryStore::new();
        let id = store
            .create_execution(&NewExecution::new("demo", json!({})))
            .await
            .unwrap();

        for expected in 1..=3 {
            let appended = store
                .append(NewEvent::new(id, "a", EventType::StepStarted, EventStatus::Running))
                .await
                .unwrap();
            assert_eq!(appended, Appended::Recorded(expected));
        }

        let events = store.read(id, 1).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn test_append_idempotency_key() {
        let store = InMemoryStore::new();
        let id = store
            .create_execution(&NewExecution::new("demo", json!({})))
            .await
            .unwrap();
        let event = NewEvent::new(id, "a", EventType::StepCompleted, EventStatus::Completed)
            .with_key("completed:a:1");

        assert_eq!(store.append(event.clone()).await.unwrap(), Appended::Recorded(1));
        assert_eq!(store.append(event).await.unwrap(), Appended::Existing(1));
        assert_eq!(store.read(id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_unknown_execution() {
        let store = InMemoryStore::new();
        let err = store
            .append(NewEvent::new(9, "a", EventType::StepStarted, EventStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_terminal_event_finishes_execution() {
        let store = InMemoryStore::new();
        let id = store
            .create_execution(&NewExecution::new("demo", json!({})))
            .await
            .unwrap();
        assert_eq!(store.running_executions().await.unwrap(), vec![id]);

        store
            .append(NewEvent::new(id, "demo", EventType::PlaybookFailed, EventStatus::Failed))
            .await
            .unwrap();
        store
            .append(NewEvent::new(id, "demo", EventType::PlaybookCompleted, EventStatus::Completed))
            .await
            .unwrap();

        let execution = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.last_event_id, 2);
        assert!(store.running_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_without_events() {
        let store = InMemoryStore::new();
        let id = store
            .create_execution(&NewExecution::new("demo", json!({})))
            .await
            .unwrap();
        assert!(matches!(
            store.replay(id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_guard() {
        let store = InMemoryStore::new();
        let first = store.enqueue(&request("a")).await.unwrap();
        assert!(matches!(
            store.enqueue(&request("a")).await,
            Err(EngineError::DuplicateEnqueue { .. })
        ));

        let item = store.lease("w-1", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(matches!(
            store.enqueue(&request("a")).await,
            Err(EngineError::DuplicateEnqueue { .. })
        ));

        store.complete(item.queue_id, "w-1", &json!({})).await.unwrap();
        let second = store.enqueue(&request("a")).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_lease_oldest_first_and_exclusive() {
        let store = InMemoryStore::new();
        store.enqueue(&request("a")).await.unwrap();
        store.enqueue(&request("b")).await.unwrap();

        let first = store.lease("w-1", Duration::from_secs(30)).await.unwrap().unwrap();
        let second = store.lease("w-2", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.node_id, "a");
        assert_eq!(second.node_id, "b");
        assert!(store.lease("w-3", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_increments_attempt_once() {
        let (store, clock) = store_with_clock();
        let queue_id = store.enqueue(&request("a")).await.unwrap();

        let item = store.lease("w-1", Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(item.attempt(), 1);

        clock.advance(Duration::from_secs(11));
        let item = store.lease("w-2", Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(item.queue_id, queue_id);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.lease_owner.as_deref(), Some("w-2"));

        // A second lease call within the new lease reclaims nothing.
        assert!(store.lease("w-3", Duration::from_secs(10)).await.unwrap().is_none());
        assert_eq!(store.get(queue_id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_and_stale_owner() {
        let (store, clock) = store_with_clock();
        let queue_id = store.enqueue(&request("a")).await.unwrap();
        store.lease("w-1", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(5));
        assert!(store.heartbeat(queue_id, "w-1", Duration::from_secs(10)).await.unwrap());
        assert!(!store.heartbeat(queue_id, "w-2", Duration::from_secs(10)).await.unwrap());

        clock.advance(Duration::from_secs(11));
        assert!(!store.heartbeat(queue_id, "w-1", Duration::from_secs(10)).await.unwrap());

        store.lease("w-2", Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(matches!(
            store.complete(queue_id, "w-1", &json!({})).await,
            Err(EngineError::LeaseConflict { .. })
        ));
        assert_eq!(
            store.complete(queue_id, "w-2", &json!({})).await.unwrap(),
            Completion::Applied
        );
        assert_eq!(
            store.fail(queue_id, "w-1", &json!({})).await.unwrap(),
            Completion::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_requeue_is_conditional_and_delayed() {
        let (store, clock) = store_with_clock();
        let queue_id = store.enqueue(&request("a")).await.unwrap();
        store.lease("w-1", Duration::from_secs(30)).await.unwrap();
        store.fail(queue_id, "w-1", &json!({"kind": "x"})).await.unwrap();

        assert!(store.requeue(queue_id, 0, Duration::from_secs(5)).await.unwrap());
        assert!(!store.requeue(queue_id, 0, Duration::from_secs(5)).await.unwrap());

        assert!(store.lease("w-1", Duration::from_secs(30)).await.unwrap().is_none());
        clock.advance(Duration::from_secs(5));
        let item = store.lease("w-1", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(item.attempt(), 2);
    }
}
