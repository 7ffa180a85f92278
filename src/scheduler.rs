//! Task scheduler.
//!
//! Every agent has one FIFO queue and a concurrency budget taken from its
//! resource limits. Dispatch is event driven: a queue is pumped when a task
//! is submitted to it and when one of its running tasks releases its slot.
//!
//! Each task lives in a [`TaskSlot`] holding a `watch` channel with the
//! current [`Task`] record, so callers can wait for a terminal state, and a
//! `CancellationToken` shared with the invoker. Timeouts and cancellation
//! both fire the token; the slot is released as soon as the scheduler stops
//! waiting, whether or not the agent actually stopped.
//!
//! Lock order: agent queue, then the task map. The finished list is taken
//! before the task map. Nothing is held across an `.await`.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::definition::AgentDefinition;
use crate::error::{OrchestratorError, Result};
use crate::registry::{AgentRegistry, Lifecycle};
use crate::service::{AgentInvoker, Invocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::TimedOut => write!(f, "timed-out"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// A single unit of work bound to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_name: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
}

/// What a caller hands to [`Scheduler::submit`].
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub agent_name: String,
    pub instruction: String,
    pub context: Map<String, Value>,
    /// `None` uses the scheduler default, `Some(Duration::ZERO)` disables
    /// the deadline.
    pub timeout: Option<Duration>,
    /// Refuse Degraded agents instead of queueing with a warning.
    pub reject_degraded: bool,
    pub workflow_id: Option<String>,
}

impl TaskRequest {
    pub fn new(agent_name: &str, instruction: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            instruction: instruction.to_string(),
            context: Map::new(),
            timeout: None,
            reject_degraded: false,
            workflow_id: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn rejecting_degraded(mut self) -> Self {
        self.reject_degraded = true;
        self
    }

    pub fn for_workflow(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_timeout: Option<Duration>,
    /// Terminal tasks kept for status queries; the oldest go first.
    pub max_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(300)),
            max_history: 1000,
        }
    }
}

struct TaskSlot {
    tx: watch::Sender<Task>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl TaskSlot {
    fn snapshot(&self) -> Task {
        self.tx.borrow().clone()
    }

    /// Move a non-terminal task to `state`. Returns the state it was in, or
    /// `None` if it was already terminal and nothing changed.
    fn complete(&self, state: TaskState, result: Option<Value>, error: Option<String>) -> Option<TaskState> {
        let mut previous = None;
        self.tx.send_if_modified(|task| {
            if task.state.is_terminal() {
                return false;
            }
            previous = Some(task.state);
            task.state = state;
            task.result = result;
            task.error = error;
            task.completed_at = Some(Utc::now());
            true
        });
        previous
    }
}

#[derive(Default)]
struct AgentQueue {
    pending: VecDeque<String>,
    running: usize,
    limit: usize,
    closed: bool,
}

type QueueRef = Arc<Mutex<AgentQueue>>;

fn lock_queue(queue: &QueueRef) -> MutexGuard<'_, AgentQueue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

enum Outcome {
    Succeeded(Value),
    Failed(String),
    TimedOut(u64),
    Cancelled(String),
}

struct Inner {
    registry: Arc<AgentRegistry>,
    invoker: Arc<dyn AgentInvoker>,
    config: SchedulerConfig,
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
    queues: Mutex<HashMap<String, QueueRef>>,
    finished: Mutex<VecDeque<String>>,
}

/// Per-agent FIFO task scheduler. Cheap to clone; clones share state.
///
/// Submitting spawns onto the current tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(registry: Arc<AgentRegistry>, invoker: Arc<dyn AgentInvoker>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                invoker,
                config,
                tasks: RwLock::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn slot(&self, task_id: &str) -> Option<Arc<TaskSlot>> {
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.get(task_id).cloned()
    }

    fn slot_or_not_found(&self, task_id: &str) -> Result<Arc<TaskSlot>> {
        self.slot(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task '{}'", task_id)))
    }

    fn queue(&self, agent: &str) -> Option<QueueRef> {
        let queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(agent).cloned()
    }

    fn queue_or_create(&self, agent: &str) -> QueueRef {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.entry(agent.to_string()).or_default().clone()
    }

    /// Queue a task for its agent and return the task id.
    pub fn submit(&self, req: TaskRequest) -> Result<String> {
        self.submit_watched(req).map(|(id, _)| id)
    }

    /// Like [`Scheduler::submit`], also returning a receiver for the task
    /// record. The receiver stays valid after the task leaves the history.
    pub fn submit_watched(&self, req: TaskRequest) -> Result<(String, watch::Receiver<Task>)> {
        let name = req.agent_name.clone();
        let (def, state) = self
            .inner
            .registry
            .get(&name)
            .map_err(|_| OrchestratorError::UnknownAgent(name.clone()))?;
        check_accepts_work(&def, state.lifecycle, req.reject_degraded)?;

        let timeout = match req.timeout {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => self.inner.config.default_timeout,
        };
        let id = format!("task-{}", Uuid::new_v4());
        let task = Task {
            id: id.clone(),
            agent_name: name.clone(),
            instruction: req.instruction,
            context: req.context,
            state: TaskState::Queued,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            workflow_id: req.workflow_id,
        };
        let (tx, rx) = watch::channel(task);
        let slot = Arc::new(TaskSlot {
            tx,
            cancel: CancellationToken::new(),
            timeout,
        });

        let queue = self.queue_or_create(&name);
        {
            let mut q = lock_queue(&queue);
            // Deregistration closes the queue while holding its lock.
            if q.closed || !self.inner.registry.contains(&name) {
                return Err(OrchestratorError::UnknownAgent(name));
            }
            q.limit = def.resource_limits.concurrency.max(1) as usize;
            self.inner
                .tasks
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), slot);
            q.pending.push_back(id.clone());
        }
        debug!("Queued {} for agent '{}'", id, name);

        self.pump(&queue);
        Ok((id, rx))
    }

    /// Start queued tasks while the agent has budget left.
    fn pump(&self, queue: &QueueRef) {
        let mut q = lock_queue(queue);
        while q.running < q.limit {
            let Some(id) = q.pending.pop_front() else {
                break;
            };
            let Some(slot) = self.slot(&id) else {
                continue;
            };
            let started = slot.tx.send_if_modified(|task| {
                if task.state != TaskState::Queued {
                    return false;
                }
                task.state = TaskState::Running;
                task.started_at = Some(Utc::now());
                true
            });
            if !started {
                continue;
            }
            q.running += 1;
            let scheduler = self.clone();
            let queue = queue.clone();
            tokio::spawn(async move { scheduler.run_task(slot, queue).await });
        }
    }

    async fn run_task(self, slot: Arc<TaskSlot>, queue: QueueRef) {
        let task = slot.snapshot();
        let outcome = match self.inner.registry.get(&task.agent_name) {
            Ok((agent, _)) => self.invoke(&slot, task.clone(), agent).await,
            Err(_) => Outcome::Cancelled(format!("agent '{}' was deregistered", task.agent_name)),
        };
        self.finish(&slot, outcome);
        self.retire(&task.id);

        lock_queue(&queue).running -= 1;
        // A re-registered agent gets a fresh queue; only pump our own.
        if self
            .queue(&task.agent_name)
            .is_some_and(|current| Arc::ptr_eq(&current, &queue))
        {
            self.pump(&queue);
        }
    }

    async fn invoke(&self, slot: &TaskSlot, task: Task, agent: AgentDefinition) -> Outcome {
        let deadline = slot
            .timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|d| Utc::now() + d);
        let timeout_ms = task.timeout_ms.unwrap_or_default();
        let call = Invocation {
            task_id: task.id,
            agent,
            instruction: task.instruction,
            context: task.context,
            deadline,
        };
        let invocation = self.inner.invoker.invoke(&call, slot.cancel.clone());
        let bounded = async {
            match slot.timeout {
                Some(t) => tokio::time::timeout(t, invocation).await.ok(),
                None => Some(invocation.await),
            }
        };

        tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => Outcome::Cancelled("cancelled".to_string()),
            res = bounded => match res {
                Some(Ok(value)) => Outcome::Succeeded(value),
                Some(Err(e)) => Outcome::Failed(non_empty(e.to_string(), "agent failed without a message")),
                None => Outcome::TimedOut(timeout_ms),
            },
        }
    }

    fn finish(&self, slot: &TaskSlot, outcome: Outcome) {
        let (state, result, error) = match outcome {
            Outcome::Succeeded(v) => (TaskState::Succeeded, Some(v), None),
            Outcome::Failed(e) => (TaskState::Failed, None, Some(e)),
            Outcome::TimedOut(ms) => (
                TaskState::TimedOut,
                None,
                Some(OrchestratorError::TaskTimeout(ms).to_string()),
            ),
            Outcome::Cancelled(e) => (TaskState::Cancelled, None, Some(e)),
        };
        if state == TaskState::TimedOut {
            slot.cancel.cancel();
        }
        // Already terminal means cancel() or deregistration got there first.
        if slot.complete(state, result, error.clone()).is_none() {
            return;
        }

        let task = slot.snapshot();
        match state {
            TaskState::Succeeded => {
                info!("Task {} on '{}' succeeded", task.id, task.agent_name);
                self.inner.registry.record_task_outcome(&task.agent_name, true);
            }
            TaskState::Failed | TaskState::TimedOut => {
                warn!(
                    "Task {} on '{}' {}: {}",
                    task.id,
                    task.agent_name,
                    state,
                    error.unwrap_or_default()
                );
                self.inner.registry.record_task_outcome(&task.agent_name, false);
            }
            _ => info!("Task {} on '{}' {}", task.id, task.agent_name, state),
        }
    }

    /// Record a terminal task in the history and drop the oldest beyond
    /// the retention limit. A task evicted before its runner got here is
    /// not recorded.
    fn retire(&self, task_id: &str) {
        let mut finished = self.inner.finished.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.inner.tasks.write().unwrap_or_else(|e| e.into_inner());
        if !tasks.contains_key(task_id) {
            return;
        }
        finished.push_back(task_id.to_string());
        while finished.len() > self.inner.config.max_history {
            if let Some(old) = finished.pop_front() {
                tasks.remove(&old);
            }
        }
    }

    /// Cancel a queued or running task.
    pub fn cancel(&self, task_id: &str) -> Result<Task> {
        let slot = self.slot_or_not_found(task_id)?;
        let agent = slot.snapshot().agent_name;
        let queue = self.queue(&agent);
        let mut guard = queue.as_ref().map(lock_queue);

        let Some(previous) = slot.complete(
            TaskState::Cancelled,
            None,
            Some("cancelled by request".to_string()),
        ) else {
            let state = slot.snapshot().state;
            return Err(OrchestratorError::InvalidState {
                task_id: task_id.to_string(),
                state,
            });
        };

        if previous == TaskState::Queued {
            if let Some(q) = guard.as_mut() {
                q.pending.retain(|id| id != task_id);
            }
            drop(guard);
            self.retire(task_id);
        } else {
            drop(guard);
            // The runner notices, retires the task and releases the slot.
            slot.cancel.cancel();
        }
        info!("Cancelled {} ({} on '{}')", task_id, previous, agent);
        Ok(slot.snapshot())
    }

    pub fn get_status(&self, task_id: &str) -> Result<Task> {
        Ok(self.slot_or_not_found(task_id)?.snapshot())
    }

    /// Receiver for a task's record, updated on every state change.
    pub fn subscribe(&self, task_id: &str) -> Result<watch::Receiver<Task>> {
        Ok(self.slot_or_not_found(task_id)?.tx.subscribe())
    }

    /// Suspend until the task reaches a terminal state.
    pub async fn wait(&self, task_id: &str) -> Result<Task> {
        settled(self.subscribe(task_id)?).await
    }

    /// Queued and running tasks, oldest submission first.
    pub fn list_active(&self) -> Vec<Task> {
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<Task> = tasks
            .values()
            .map(|slot| slot.snapshot())
            .filter(|task| !task.state.is_terminal())
            .collect();
        active.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Terminal tasks, most recently finished first.
    pub fn history(&self, limit: usize) -> Vec<Task> {
        let finished = self.inner.finished.lock().unwrap_or_else(|e| e.into_inner());
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        finished
            .iter()
            .rev()
            .filter_map(|id| tasks.get(id).map(|slot| slot.snapshot()))
            .take(limit)
            .collect()
    }

    /// Drop a terminal task from the history.
    pub fn evict(&self, task_id: &str) -> Result<Task> {
        let slot = self.slot_or_not_found(task_id)?;
        let task = slot.snapshot();
        if !task.state.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                task_id: task_id.to_string(),
                state: task.state,
            });
        }
        let mut finished = self.inner.finished.lock().unwrap_or_else(|e| e.into_inner());
        finished.retain(|id| id != task_id);
        self.inner
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
        Ok(task)
    }

    fn active_slots(&self, agent: &str) -> Vec<Arc<TaskSlot>> {
        let tasks = self.inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks
            .values()
            .filter(|slot| {
                let task = slot.tx.borrow();
                task.agent_name == agent && !task.state.is_terminal()
            })
            .cloned()
            .collect()
    }

    /// Number of queued or running tasks for an agent.
    pub fn in_flight(&self, agent: &str) -> usize {
        self.active_slots(agent).len()
    }

    /// Remove an agent from the registry. An agent with queued or running
    /// tasks is refused unless `force` is set, in which case those tasks
    /// are cancelled.
    pub fn deregister(&self, name: &str, force: bool) -> Result<AgentDefinition> {
        if !self.inner.registry.contains(name) {
            return Err(OrchestratorError::NotFound(format!("agent '{}'", name)));
        }
        let queue = self.queue_or_create(name);
        let mut q = lock_queue(&queue);

        let active = self.active_slots(name);
        if !active.is_empty() && !force {
            return Err(OrchestratorError::AgentBusy {
                agent: name.to_string(),
                in_flight: active.len(),
            });
        }
        let def = self.inner.registry.remove(name)?;

        let mut dequeued = Vec::new();
        for slot in &active {
            let cause = format!("agent '{}' was deregistered", name);
            match slot.complete(TaskState::Cancelled, None, Some(cause)) {
                Some(TaskState::Queued) => dequeued.push(slot.snapshot().id),
                Some(_) => slot.cancel.cancel(),
                None => {}
            }
        }
        q.pending.clear();
        q.closed = true;
        drop(q);

        {
            let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
            if queues.get(name).is_some_and(|current| Arc::ptr_eq(current, &queue)) {
                queues.remove(name);
            }
        }
        for id in dequeued {
            self.retire(&id);
        }
        if !active.is_empty() {
            info!("Cancelled {} task(s) of deregistered agent '{}'", active.len(), name);
        }
        Ok(def)
    }
}

/// Wait on a task receiver until the task is terminal.
pub async fn settled(mut rx: watch::Receiver<Task>) -> Result<Task> {
    let task_id = rx.borrow().id.clone();
    let task = rx
        .wait_for(|task| task.state.is_terminal())
        .await
        .map_err(|_| OrchestratorError::NotFound(format!("task '{}'", task_id)))?
        .clone();
    Ok(task)
}

fn check_accepts_work(def: &AgentDefinition, lifecycle: Lifecycle, reject_degraded: bool) -> Result<()> {
    if lifecycle.rejects_work() || (reject_degraded && lifecycle == Lifecycle::Degraded) {
        return Err(OrchestratorError::AgentUnavailable {
            agent: def.name.clone(),
            lifecycle,
        });
    }
    if lifecycle == Lifecycle::Degraded {
        warn!("Agent '{}' is degraded; queueing anyway", def.name);
    }
    Ok(())
}

fn non_empty(msg: String, fallback: &str) -> String {
    if msg.trim().is_empty() {
        fallback.to_string()
    } else {
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::LocalInvoker;
    use serde_json::json;

    fn setup(config: SchedulerConfig) -> (Arc<AgentRegistry>, Arc<LocalInvoker>, Scheduler) {
        let registry = Arc::new(AgentRegistry::in_memory());
        let invoker = Arc::new(LocalInvoker::new());
        let scheduler = Scheduler::new(registry.clone(), invoker.clone(), config);
        (registry, invoker, scheduler)
    }

    #[test]
    fn test_task_state_serde() {
        assert_eq!(serde_json::to_string(&TaskState::TimedOut).unwrap(), "\"timed-out\"");
        assert_eq!(TaskState::TimedOut.to_string(), "timed-out");
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[tokio::test]
    async fn test_submit_unknown_agent() {
        let (_, _, scheduler) = setup(SchedulerConfig::default());
        let err = scheduler.submit(TaskRequest::new("ghost", "x")).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownAgent(ref n) if n == "ghost"));
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig::default());
        registry.register(AgentDefinition::new("echo")).unwrap();
        invoker.register("echo", |call, _| async move {
            Ok(json!({"said": call.instruction, "ctx": call.context}))
        });

        let mut ctx = Map::new();
        ctx.insert("k".to_string(), json!(1));
        let id = scheduler
            .submit(TaskRequest::new("echo", "hi").with_context(ctx))
            .unwrap();
        let task = scheduler.wait(&id).await.unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.result, Some(json!({"said": "hi", "ctx": {"k": 1}})));
        assert!(task.started_at.is_some() && task.completed_at.is_some());
        assert_eq!(task.timeout_ms, Some(300_000));
        assert_eq!(scheduler.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_captured_and_counted() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig::default());
        registry.register(AgentDefinition::new("bad")).unwrap();
        invoker.register("bad", |_, _| async move {
            Err(OrchestratorError::Invocation("boom".to_string()))
        });

        let id = scheduler.submit(TaskRequest::new("bad", "x")).unwrap();
        let task = scheduler.wait(&id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some("Invocation failed: boom"));
        assert_eq!(registry.state("bad").unwrap().consecutive_failures, 1);
        assert_eq!(registry.state("bad").unwrap().lifecycle, Lifecycle::Registered);
    }

    #[tokio::test]
    async fn test_timeout_marks_timed_out_and_frees_slot() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig::default());
        registry.register(AgentDefinition::new("slow")).unwrap();
        invoker.register("slow", |call, _| async move {
            if call.instruction == "hang" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(json!("done"))
        });

        let hung = scheduler
            .submit(TaskRequest::new("slow", "hang").with_timeout(Duration::from_millis(50)))
            .unwrap();
        let next = scheduler.submit(TaskRequest::new("slow", "quick")).unwrap();

        let task = scheduler.wait(&hung).await.unwrap();
        assert_eq!(task.state, TaskState::TimedOut);
        assert_eq!(task.error.as_deref(), Some("Task exceeded its deadline of 50 ms"));

        let task = scheduler.wait(&next).await.unwrap();
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(scheduler.get_status(&hung).unwrap().state, TaskState::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig::default());
        registry.register(AgentDefinition::new("busy")).unwrap();
        invoker.register("busy", |_, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(OrchestratorError::Invocation("stopped".to_string()))
        });

        let running = scheduler.submit(TaskRequest::new("busy", "a")).unwrap();
        let queued = scheduler.submit(TaskRequest::new("busy", "b")).unwrap();
        assert_eq!(scheduler.get_status(&running).unwrap().state, TaskState::Running);
        assert_eq!(scheduler.get_status(&queued).unwrap().state, TaskState::Queued);

        let task = scheduler.cancel(&queued).unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.started_at.is_none());

        scheduler.cancel(&running).unwrap();
        let task = scheduler.wait(&running).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.error.is_some());

        let err = scheduler.cancel(&running).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { state: TaskState::Cancelled, .. }));
        assert!(matches!(scheduler.cancel("task-nope"), Err(OrchestratorError::NotFound(_))));
        // Cancellation is not an agent failure.
        assert_eq!(registry.state("busy").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unavailable_lifecycles() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig::default());
        registry.register(AgentDefinition::new("a")).unwrap();
        invoker.set_fallback(|_, _| async move { Ok(Value::Null) });

        registry.record_probe("a", false, 3).unwrap();
        assert_eq!(registry.state("a").unwrap().lifecycle, Lifecycle::Degraded);
        assert!(scheduler.submit(TaskRequest::new("a", "x")).is_ok());
        let err = scheduler
            .submit(TaskRequest::new("a", "x").rejecting_degraded())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentUnavailable { .. }));

        registry.stop("a").unwrap();
        let err = scheduler.submit(TaskRequest::new("a", "x")).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::AgentUnavailable { lifecycle: Lifecycle::Stopped, .. }
        ));
    }

    #[tokio::test]
    async fn test_history_retention_and_evict() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig {
            max_history: 2,
            ..SchedulerConfig::default()
        });
        registry.register(AgentDefinition::new("e")).unwrap();
        invoker.set_fallback(|call, _| async move { Ok(json!(call.instruction)) });

        let mut ids = Vec::new();
        for i in 0..3 {
            let id = scheduler.submit(TaskRequest::new("e", &i.to_string())).unwrap();
            scheduler.wait(&id).await.unwrap();
            ids.push(id);
        }
        assert!(matches!(scheduler.get_status(&ids[0]), Err(OrchestratorError::NotFound(_))));
        let history: Vec<String> = scheduler.history(10).into_iter().map(|t| t.id).collect();
        assert_eq!(history, vec![ids[2].clone(), ids[1].clone()]);

        scheduler.evict(&ids[2]).unwrap();
        assert_eq!(scheduler.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_watched_task_outlives_history() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig {
            max_history: 1,
            ..SchedulerConfig::default()
        });
        registry.register(AgentDefinition::new("e").with_concurrency(4)).unwrap();
        invoker.set_fallback(|call, _| async move { Ok(json!(call.instruction)) });

        let (first, rx) = scheduler.submit_watched(TaskRequest::new("e", "kept")).unwrap();
        for i in 0..3 {
            let id = scheduler.submit(TaskRequest::new("e", &i.to_string())).unwrap();
            scheduler.wait(&id).await.unwrap();
        }
        assert!(scheduler.get_status(&first).is_err());

        let task = settled(rx).await.unwrap();
        assert_eq!(task.id, first);
        assert_eq!(task.state, TaskState::Succeeded);
        assert_eq!(task.result, Some(json!("kept")));
    }

    #[tokio::test]
    async fn test_evicting_cancelled_task_before_runner_retires_it() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig {
            max_history: 2,
            ..SchedulerConfig::default()
        });
        registry.register(AgentDefinition::new("e")).unwrap();
        invoker.set_fallback(|call, _| async move {
            if call.instruction == "hang" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(json!(call.instruction))
        });

        let first = scheduler.submit(TaskRequest::new("e", "first")).unwrap();
        scheduler.wait(&first).await.unwrap();

        let hung = scheduler.submit(TaskRequest::new("e", "hang")).unwrap();
        tokio::task::yield_now().await;
        scheduler.cancel(&hung).unwrap();
        scheduler.evict(&hung).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let last = scheduler.submit(TaskRequest::new("e", "last")).unwrap();
        scheduler.wait(&last).await.unwrap();

        // The evicted task took no history slot, so `first` is still kept.
        let history: Vec<String> = scheduler.history(10).into_iter().map(|t| t.id).collect();
        assert_eq!(history, vec![last, first]);
    }

    #[tokio::test]
    async fn test_deregister_busy_and_forced() {
        let (registry, invoker, scheduler) = setup(SchedulerConfig::default());
        registry.register(AgentDefinition::new("w")).unwrap();
        invoker.register("w", |_, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Ok(Value::Null)
        });

        let running = scheduler.submit(TaskRequest::new("w", "a")).unwrap();
        let queued = scheduler.submit(TaskRequest::new("w", "b")).unwrap();
        assert_eq!(scheduler.in_flight("w"), 2);

        let err = scheduler.deregister("w", false).unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentBusy { in_flight: 2, .. }));
        assert!(registry.contains("w"));

        scheduler.deregister("w", true).unwrap();
        assert!(!registry.contains("w"));
        assert_eq!(scheduler.wait(&running).await.unwrap().state, TaskState::Cancelled);
        assert_eq!(scheduler.get_status(&queued).unwrap().state, TaskState::Cancelled);
        assert!(matches!(
            scheduler.submit(TaskRequest::new("w", "c")),
            Err(OrchestratorError::UnknownAgent(_))
        ));
        assert!(matches!(scheduler.deregister("w", false), Err(OrchestratorError::NotFound(_))));
    }
}
