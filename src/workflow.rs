//! Workflow executor.
//!
//! A workflow is a DAG of steps. Validation rejects malformed graphs before
//! anything is submitted. Execution walks the graph layer by layer: every
//! step of a layer is submitted to the scheduler in step-id order, then the
//! layer is awaited as a whole before the next one starts.
//!
//! Step inputs are bound from earlier outputs with string references:
//!
//! - `$steps.<id>` or `$steps.<id>.<path>` picks a prior step's result,
//!   where `<path>` walks object keys and array indices separated by `.`
//! - `$context.<key>[.<path>]` picks from the workflow context
//!
//! Any other value is passed through literally.

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::check::{self, DependencyGraph};
use crate::error::{OrchestratorError, Result};
use crate::scheduler::{Scheduler, Task, TaskRequest, TaskState, settled};

const STEP_REF: &str = "$steps.";
const CONTEXT_REF: &str = "$context.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Exact agent name. Exactly one of `agent` and `capability` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Per-attempt deadline; `0` runs without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extra attempts after a failed or timed-out task.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl WorkflowStep {
    pub fn for_agent(id: &str, agent: &str, instruction: &str) -> Self {
        Self {
            id: id.to_string(),
            agent: Some(agent.to_string()),
            capability: None,
            instruction: instruction.to_string(),
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
            timeout_secs: None,
            retries: 0,
        }
    }

    pub fn for_capability(id: &str, capability: &str, instruction: &str) -> Self {
        Self {
            agent: None,
            capability: Some(capability.to_string()),
            ..Self::for_agent(id, "", instruction)
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_input(mut self, name: &str, binding: Value) -> Self {
        self.inputs.insert(name.to_string(), binding);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Step ids referenced by `$steps.` inputs.
    fn input_sources(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inputs.iter().filter_map(|(name, binding)| {
            let reference = binding.as_str()?.strip_prefix(STEP_REF)?;
            let source = reference.split('.').next().unwrap_or_default();
            Some((name.as_str(), source))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failing step and cancel its siblings.
    #[default]
    #[serde(alias = "failFast")]
    FailFast,
    /// Keep going; only dependents of failed steps are skipped.
    #[serde(alias = "bestEffort")]
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Generated on submission when empty.
    #[serde(default)]
    pub id: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Workflow {
    pub fn new(steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: String::new(),
            steps,
            policy: FailurePolicy::default(),
            context: Map::new(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Parse a workflow document. YAML is accepted, and JSON with it.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    fn graph(&self) -> DependencyGraph {
        self.steps
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Validating,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Validating => write!(f, "validating"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::CompletedWithErrors => write!(f, "completed-with-errors"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Validating | WorkflowStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    /// Never submitted because a dependency did not succeed.
    Skipped,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Pending => write!(f, "pending"),
            StepState::Running => write!(f, "running"),
            StepState::Succeeded => write!(f, "succeeded"),
            StepState::Failed => write!(f, "failed"),
            StepState::TimedOut => write!(f, "timed-out"),
            StepState::Cancelled => write!(f, "cancelled"),
            StepState::Skipped => write!(f, "skipped"),
        }
    }
}

impl StepState {
    /// Failed, TimedOut and Cancelled. Skipped steps are a consequence,
    /// not a failure of their own.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepState::Failed | StepState::TimedOut | StepState::Cancelled)
    }
}

impl From<TaskState> for StepState {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Queued => StepState::Pending,
            TaskState::Running => StepState::Running,
            TaskState::Succeeded => StepState::Succeeded,
            TaskState::Failed => StepState::Failed,
            TaskState::TimedOut => StepState::TimedOut,
            TaskState::Cancelled => StepState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Task of the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl StepResult {
    fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            agent: None,
            task_id: None,
            state: StepState::Pending,
            output: None,
            error: None,
            attempts: 0,
        }
    }

    fn ended(step_id: &str, state: StepState, error: String) -> Self {
        Self {
            state,
            error: Some(error),
            ..Self::pending(step_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub state: StepState,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub policy: FailurePolicy,
    pub layers: Vec<Vec<String>>,
    pub steps: BTreeMap<String, StepResult>,
    /// Cause of a Failed or Cancelled workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StepFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Check the step graph of a workflow and compute its layering.
///
/// This only looks at the workflow itself; agent resolution is checked by
/// [`WorkflowExecutor::validate`].
pub fn layers(workflow: &Workflow) -> Result<Vec<Vec<String>>> {
    if workflow.steps.is_empty() {
        return Err(OrchestratorError::Validation("workflow has no steps".to_string()));
    }

    let mut ids = HashSet::new();
    for step in &workflow.steps {
        if step.id.is_empty()
            || !step
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OrchestratorError::Validation(format!(
                "invalid step id '{}': use letters, digits, '-' and '_'",
                step.id
            )));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(OrchestratorError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        match (&step.agent, &step.capability) {
            (Some(a), None) if !a.is_empty() => {}
            (None, Some(c)) if !c.is_empty() => {}
            _ => {
                return Err(OrchestratorError::Validation(format!(
                    "step '{}' must name exactly one of agent or capability",
                    step.id
                )));
            }
        }
    }

    let graph = workflow.graph();
    if let Some(orphan) = check::check_orphans(&graph).into_iter().next() {
        return Err(OrchestratorError::UnresolvedStep {
            step: orphan.from,
            missing: orphan.to,
        });
    }
    if let Some(cycle) = check::check_cycles(&graph).into_iter().next() {
        return Err(OrchestratorError::Cycle(cycle));
    }

    for step in &workflow.steps {
        let upstream = check::ancestors(&graph, &step.id);
        for (input, source) in step.input_sources() {
            if !upstream.contains(source) {
                return Err(OrchestratorError::Validation(format!(
                    "input '{}' of step '{}' reads step '{}', which it does not depend on",
                    input, step.id, source
                )));
            }
        }
        for (input, binding) in &step.inputs {
            if let Some(key) = binding.as_str().and_then(|s| s.strip_prefix(CONTEXT_REF)) {
                let head = key.split('.').next().unwrap_or_default();
                if !workflow.context.contains_key(head) {
                    return Err(OrchestratorError::Validation(format!(
                        "input '{}' of step '{}' reads missing context key '{}'",
                        input, step.id, head
                    )));
                }
            }
        }
    }

    check::layers(&graph).ok_or_else(|| {
        OrchestratorError::Validation("workflow graph cannot be layered".to_string())
    })
}

fn walk<'a>(mut value: &'a Value, path: &str) -> Option<&'a Value> {
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn bind_input(
    binding: &Value,
    context: &Map<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<Value> {
    let Some(text) = binding.as_str() else {
        return Ok(binding.clone());
    };
    let (root, reference) = if let Some(r) = text.strip_prefix(STEP_REF) {
        let (id, path) = r.split_once('.').unwrap_or((r, ""));
        (outputs.get(id), path)
    } else if let Some(r) = text.strip_prefix(CONTEXT_REF) {
        let (key, path) = r.split_once('.').unwrap_or((r, ""));
        (context.get(key), path)
    } else {
        return Ok(binding.clone());
    };
    root.and_then(|v| walk(v, reference))
        .cloned()
        .ok_or_else(|| OrchestratorError::Validation(format!("'{}' did not resolve", text)))
}

/// Task context for a step: workflow context, then `result_<dep>` for each
/// direct dependency, then the bound inputs.
fn step_context(
    workflow: &Workflow,
    step: &WorkflowStep,
    outputs: &HashMap<String, Value>,
) -> Result<Map<String, Value>> {
    let mut context = workflow.context.clone();
    for dep in &step.depends_on {
        if let Some(output) = outputs.get(dep) {
            context.insert(format!("result_{}", dep), output.clone());
        }
    }
    for (name, binding) in &step.inputs {
        context.insert(name.clone(), bind_input(binding, &workflow.context, outputs)?);
    }
    Ok(context)
}

struct Run {
    tx: watch::Sender<WorkflowResult>,
    cancel: CancellationToken,
}

impl Run {
    fn snapshot(&self) -> WorkflowResult {
        self.tx.borrow().clone()
    }

    fn record(&self, step: StepResult) {
        self.tx.send_modify(|result| {
            result.steps.insert(step.step_id.clone(), step);
        });
    }
}

/// Finished workflow results kept for status queries; the oldest go first.
pub const DEFAULT_MAX_WORKFLOWS: usize = 200;

struct ExecutorInner {
    scheduler: Scheduler,
    max_workflows: usize,
    runs: RwLock<HashMap<String, Arc<Run>>>,
    finished: Mutex<VecDeque<String>>,
}

/// Runs workflows on top of a [`Scheduler`]. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

impl WorkflowExecutor {
    pub fn new(scheduler: Scheduler) -> Self {
        Self::with_retention(scheduler, DEFAULT_MAX_WORKFLOWS)
    }

    pub fn with_retention(scheduler: Scheduler, max_workflows: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                scheduler,
                max_workflows,
                runs: RwLock::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Full validation: graph structure, then agent resolution against the
    /// registry. Returns the layering on success.
    pub fn validate(&self, workflow: &Workflow) -> Result<Vec<Vec<String>>> {
        let layering = layers(workflow)?;
        let registry = self.inner.scheduler.registry();
        for step in &workflow.steps {
            if let Some(ref agent) = step.agent {
                if !registry.contains(agent) {
                    return Err(OrchestratorError::UnknownAgent(agent.clone()));
                }
            } else if let Some(ref capability) = step.capability
                && registry.lookup_by_capability(capability).is_empty()
            {
                return Err(OrchestratorError::NoAgentForCapability {
                    step: step.id.clone(),
                    capability: capability.clone(),
                });
            }
        }
        Ok(layering)
    }

    /// Validate and register a run. Nothing is submitted yet.
    fn start(&self, mut workflow: Workflow) -> Result<(Workflow, Vec<Vec<String>>, Arc<Run>)> {
        if workflow.id.is_empty() {
            workflow.id = format!("wf-{}", Uuid::new_v4());
        }
        let layering = self.validate(&workflow)?;

        let result = WorkflowResult {
            workflow_id: workflow.id.clone(),
            status: WorkflowStatus::Running,
            policy: workflow.policy,
            layers: layering.clone(),
            steps: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(&s.id)))
                .collect(),
            error: None,
            failures: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        let (tx, _) = watch::channel(result);
        let run = Arc::new(Run {
            tx,
            cancel: CancellationToken::new(),
        });

        let mut runs = self.inner.runs.write().unwrap_or_else(|e| e.into_inner());
        if runs
            .get(&workflow.id)
            .is_some_and(|existing| !existing.snapshot().status.is_terminal())
        {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}' is already running",
                workflow.id
            )));
        }
        runs.insert(workflow.id.clone(), run.clone());
        info!(
            "Workflow {} started: {} step(s) in {} layer(s)",
            workflow.id,
            workflow.steps.len(),
            layering.len()
        );
        Ok((workflow, layering, run))
    }

    /// Validate and start a workflow in the background; returns its id.
    pub fn submit(&self, workflow: Workflow) -> Result<String> {
        let (workflow, layering, run) = self.start(workflow)?;
        let id = workflow.id.clone();
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run(workflow, layering, run).await;
        });
        Ok(id)
    }

    /// Validate and run a workflow to completion.
    pub async fn execute(&self, workflow: Workflow) -> Result<WorkflowResult> {
        let (workflow, layering, run) = self.start(workflow)?;
        Ok(self.run(workflow, layering, run).await)
    }

    fn run_record(&self, workflow_id: &str) -> Result<Arc<Run>> {
        let runs = self.inner.runs.read().unwrap_or_else(|e| e.into_inner());
        runs.get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow '{}'", workflow_id)))
    }

    pub fn result(&self, workflow_id: &str) -> Result<WorkflowResult> {
        Ok(self.run_record(workflow_id)?.snapshot())
    }

    /// Finished workflows, most recently finished first.
    pub fn history(&self, limit: usize) -> Vec<WorkflowResult> {
        let finished = self.inner.finished.lock().unwrap_or_else(|e| e.into_inner());
        let runs = self.inner.runs.read().unwrap_or_else(|e| e.into_inner());
        finished
            .iter()
            .rev()
            .filter_map(|id| runs.get(id).map(|run| run.snapshot()))
            .take(limit)
            .collect()
    }

    /// Drop a finished workflow's result.
    pub fn evict(&self, workflow_id: &str) -> Result<WorkflowResult> {
        let mut finished = self.inner.finished.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs = self.inner.runs.write().unwrap_or_else(|e| e.into_inner());
        let result = runs
            .get(workflow_id)
            .map(|run| run.snapshot())
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow '{}'", workflow_id)))?;
        if !result.status.is_terminal() {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}' is still {}",
                workflow_id, result.status
            )));
        }
        finished.retain(|id| id != workflow_id);
        runs.remove(workflow_id);
        Ok(result)
    }

    /// Record a finished run and drop the oldest beyond the retention limit.
    fn retire(&self, workflow_id: &str) {
        let mut finished = self.inner.finished.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs = self.inner.runs.write().unwrap_or_else(|e| e.into_inner());
        // A rerun under the same id replaces the earlier entry.
        finished.retain(|id| id != workflow_id);
        finished.push_back(workflow_id.to_string());
        while finished.len() > self.inner.max_workflows {
            let Some(old) = finished.pop_front() else {
                break;
            };
            if runs.get(&old).is_some_and(|run| run.snapshot().status.is_terminal()) {
                runs.remove(&old);
            }
        }
    }

    pub async fn wait(&self, workflow_id: &str) -> Result<WorkflowResult> {
        let run = self.run_record(workflow_id)?;
        let mut rx = run.tx.subscribe();
        let result = rx
            .wait_for(|r| r.status.is_terminal())
            .await
            .map_err(|_| OrchestratorError::NotFound(format!("workflow '{}'", workflow_id)))?
            .clone();
        Ok(result)
    }

    /// Cancel every unfinished step of a running workflow. The workflow
    /// reaches Cancelled once its in-flight tasks have stopped; a finished
    /// workflow is returned unchanged.
    pub fn cancel(&self, workflow_id: &str) -> Result<WorkflowResult> {
        let run = self.run_record(workflow_id)?;
        let current = run.snapshot();
        if !current.status.is_terminal() {
            info!("Cancelling workflow {}", workflow_id);
            run.cancel.cancel();
        }
        Ok(current)
    }

    /// Pick the agent for a step. Capability steps take the first agent in
    /// registration order that currently accepts work, falling back to the
    /// first match so the scheduler reports why it is unavailable.
    fn resolve_agent(&self, step: &WorkflowStep) -> Result<String> {
        if let Some(ref agent) = step.agent {
            return Ok(agent.clone());
        }
        let capability = step.capability.clone().unwrap_or_default();
        let registry = self.inner.scheduler.registry();
        let candidates = registry.lookup_by_capability(&capability);
        candidates
            .iter()
            .find(|def| {
                registry
                    .state(&def.name)
                    .is_ok_and(|s| !s.lifecycle.rejects_work())
            })
            .or_else(|| candidates.first())
            .map(|def| def.name.clone())
            .ok_or_else(|| OrchestratorError::NoAgentForCapability {
                step: step.id.clone(),
                capability,
            })
    }

    fn launch(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        outputs: &HashMap<String, Value>,
    ) -> Result<(TaskRequest, String, watch::Receiver<Task>)> {
        let agent = self.resolve_agent(step)?;
        let context = step_context(workflow, step, outputs)?;
        let mut request = TaskRequest::new(&agent, &step.instruction)
            .with_context(context)
            .for_workflow(&workflow.id);
        if let Some(secs) = step.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        let (task_id, rx) = self.inner.scheduler.submit_watched(request.clone())?;
        Ok((request, task_id, rx))
    }

    /// Wait for a step's task, resubmitting on failure while retries remain.
    async fn follow(
        &self,
        step: &WorkflowStep,
        request: TaskRequest,
        first_task: String,
        mut rx: watch::Receiver<Task>,
        token: CancellationToken,
    ) -> StepResult {
        let scheduler = &self.inner.scheduler;
        let mut result = StepResult {
            agent: Some(request.agent_name.clone()),
            task_id: Some(first_task.clone()),
            attempts: 1,
            ..StepResult::pending(&step.id)
        };
        let mut task_id = first_task;

        loop {
            let waited = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if let Err(e) = scheduler.cancel(&task_id) {
                        debug!("Step '{}' task {} not cancelled: {}", step.id, task_id, e);
                    }
                    settled(rx.clone()).await
                }
                task = settled(rx.clone()) => task,
            };
            let task = match waited {
                Ok(task) => task,
                Err(e) => {
                    result.state = StepState::Failed;
                    result.error = Some(e.to_string());
                    return result;
                }
            };

            match task.state {
                TaskState::Succeeded => {
                    result.state = StepState::Succeeded;
                    result.output = Some(task.result.unwrap_or(Value::Null));
                    return result;
                }
                TaskState::Failed | TaskState::TimedOut
                    if result.attempts <= step.retries && !token.is_cancelled() =>
                {
                    warn!(
                        "Step '{}' attempt {} {}, retrying",
                        step.id, result.attempts, task.state
                    );
                    match scheduler.submit_watched(request.clone()) {
                        Ok((id, next)) => {
                            task_id = id;
                            rx = next;
                            result.task_id = Some(task_id.clone());
                            result.attempts += 1;
                        }
                        Err(e) => {
                            result.state = StepState::Failed;
                            result.error = Some(e.to_string());
                            return result;
                        }
                    }
                }
                state => {
                    result.state = state.into();
                    result.error = Some(
                        task.error
                            .unwrap_or_else(|| format!("task {} ended {}", task.id, state)),
                    );
                    return result;
                }
            }
        }
    }

    async fn run(&self, workflow: Workflow, layering: Vec<Vec<String>>, run: Arc<Run>) -> WorkflowResult {
        let fail_fast = workflow.policy == FailurePolicy::FailFast;
        let steps: HashMap<&str, &WorkflowStep> =
            workflow.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut states: HashMap<String, StepState> = HashMap::new();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut trigger: Option<String> = None;

        for layer in &layering {
            if run.cancel.is_cancelled() || (fail_fast && trigger.is_some()) {
                break;
            }
            let layer_token = run.cancel.child_token();
            let mut waiting = FuturesUnordered::new();

            for id in layer {
                if run.cancel.is_cancelled() || (fail_fast && trigger.is_some()) {
                    break;
                }
                let Some(step) = steps.get(id.as_str()).copied() else {
                    continue;
                };
                if let Some(dep) = step
                    .depends_on
                    .iter()
                    .find(|d| states.get(d.as_str()) != Some(&StepState::Succeeded))
                {
                    states.insert(id.clone(), StepState::Skipped);
                    run.record(StepResult::ended(
                        id,
                        StepState::Skipped,
                        format!("dependency '{}' did not succeed", dep),
                    ));
                    continue;
                }

                match self.launch(&workflow, step, &outputs) {
                    Ok((request, task_id, rx)) => {
                        debug!("Step '{}' submitted as {}", id, task_id);
                        run.record(StepResult {
                            agent: Some(request.agent_name.clone()),
                            task_id: Some(task_id.clone()),
                            state: StepState::Running,
                            attempts: 1,
                            ..StepResult::pending(id)
                        });
                        waiting.push(self.follow(step, request, task_id, rx, layer_token.clone()));
                    }
                    Err(e) => {
                        warn!("Step '{}' could not be submitted: {}", id, e);
                        states.insert(id.clone(), StepState::Failed);
                        run.record(StepResult::ended(id, StepState::Failed, e.to_string()));
                        if fail_fast && trigger.is_none() {
                            trigger = Some(format!("step '{}' failed: {}", id, e));
                            layer_token.cancel();
                        }
                    }
                }
            }

            while let Some(mut step) = waiting.next().await {
                if step.state == StepState::Cancelled {
                    if run.cancel.is_cancelled() {
                        step.error = Some("workflow cancelled".to_string());
                    } else if let Some(ref cause) = trigger {
                        step.error = Some(format!("cancelled after {}", cause));
                    }
                }
                if step.state == StepState::Succeeded {
                    outputs.insert(step.step_id.clone(), step.output.clone().unwrap_or(Value::Null));
                } else {
                    warn!(
                        "Step '{}' {}: {}",
                        step.step_id,
                        step.state,
                        step.error.as_deref().unwrap_or_default()
                    );
                    if fail_fast && trigger.is_none() {
                        trigger = Some(format!(
                            "step '{}' {}: {}",
                            step.step_id,
                            step.state,
                            step.error.as_deref().unwrap_or_default()
                        ));
                        layer_token.cancel();
                    }
                }
                states.insert(step.step_id.clone(), step.state);
                run.record(step);
            }
        }

        let cancelled = run.cancel.is_cancelled();
        for step in &workflow.steps {
            if states.contains_key(&step.id) {
                continue;
            }
            let ended = if cancelled {
                StepResult::ended(&step.id, StepState::Cancelled, "workflow cancelled".to_string())
            } else {
                let cause = trigger.as_deref().unwrap_or("workflow stopped");
                StepResult::ended(&step.id, StepState::Skipped, format!("not run: {}", cause))
            };
            run.record(ended);
        }

        run.tx.send_modify(|result| {
            result.failures = result
                .steps
                .values()
                .filter(|s| s.state.is_failure())
                .map(|s| StepFailure {
                    step_id: s.step_id.clone(),
                    state: s.state,
                    error: s.error.clone().unwrap_or_default(),
                })
                .collect();
            (result.status, result.error) = if cancelled {
                (WorkflowStatus::Cancelled, Some("workflow cancelled".to_string()))
            } else if let Some(ref cause) = trigger {
                (WorkflowStatus::Failed, Some(cause.clone()))
            } else if !result.failures.is_empty() {
                (WorkflowStatus::CompletedWithErrors, None)
            } else {
                (WorkflowStatus::Completed, None)
            };
            result.completed_at = Some(Utc::now());
        });

        let result = run.snapshot();
        info!("Workflow {} {}", result.workflow_id, result.status);
        self.retire(&result.workflow_id);
        result
    }
}
