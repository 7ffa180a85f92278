//! Orchestrator: one handle wiring registry, invokers, scheduler, workflow
//! executor and health monitor together.
//!
//! This is the task/workflow submission API. Transports (the CLI, an HTTP
//! front end) sit on top of it.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::definition::{AgentDefinition, parse_document};
use crate::error::{OrchestratorError, Result};
use crate::health::{HealthMonitor, HealthProbe};
use crate::registry::{AgentRegistry, AgentState, RegistrySnapshot};
use crate::scheduler::{Scheduler, Task, TaskRequest};
use crate::service::{ExecutorConfig, HttpInvoker, InvokerRegistry, LocalInvoker, ShellInvoker};
use crate::store::DirStore;
use crate::workflow::{Workflow, WorkflowExecutor, WorkflowResult};

/// Where agent definitions live inside a data directory.
pub fn agents_dir(dir: &Path) -> PathBuf {
    dir.join("agents")
}

/// Lifecycle state saved between processes.
pub fn state_path(dir: &Path) -> PathBuf {
    dir.join("state.json")
}

/// One agent's entry in `state.json`, which lists agents in registration
/// order.
#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    name: String,
    #[serde(flatten)]
    state: AgentState,
}

pub struct Orchestrator {
    dir: Option<PathBuf>,
    config: Config,
    registry: Arc<AgentRegistry>,
    invokers: Arc<InvokerRegistry>,
    local: Arc<LocalInvoker>,
    scheduler: Scheduler,
    workflows: WorkflowExecutor,
}

impl Orchestrator {
    /// Build an orchestrator around an existing registry. The `local`,
    /// `http` and built-in `shell` invokers are always available.
    pub fn new(registry: Arc<AgentRegistry>, config: Config) -> Self {
        let invokers = Arc::new(InvokerRegistry::new());
        let local = Arc::new(LocalInvoker::new());
        invokers.register(local.clone());
        invokers.register(Arc::new(HttpInvoker::new()));
        invokers.register(Arc::new(ShellInvoker::new("shell", ExecutorConfig::default_shell())));

        let scheduler = Scheduler::new(registry.clone(), invokers.clone(), config.scheduler_config());
        let workflows =
            WorkflowExecutor::with_retention(scheduler.clone(), config.workflows.max_history);
        Self {
            dir: None,
            config,
            registry,
            invokers,
            local,
            scheduler,
            workflows,
        }
    }

    /// Orchestrator without durable storage, with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(AgentRegistry::in_memory()), Config::default())
    }

    /// Open a data directory: `config.toml`, agent definitions under
    /// `agents/` and executor configs under `executors/`.
    pub fn open(dir: &Path) -> Result<Self> {
        let config = Config::load(dir)?;
        let store = Arc::new(DirStore::new(&agents_dir(dir))?);
        let registry = Arc::new(AgentRegistry::open(store)?);
        restore_states(&registry, &state_path(dir));
        let mut orchestrator = Self::new(registry, config);
        orchestrator.dir = Some(dir.to_path_buf());
        let loaded = orchestrator.invokers.load_executors(dir)?;
        info!(
            "Opened {} with {} agent(s), {} executor config(s)",
            dir.display(),
            orchestrator.registry.len(),
            loaded
        );
        Ok(orchestrator)
    }

    /// Write every agent's lifecycle state to `state.json`. Does nothing
    /// for an orchestrator without a data directory.
    pub fn persist_state(&self) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        let states: Vec<SavedState> = self
            .registry
            .list(None)
            .into_iter()
            .map(|(def, state)| SavedState { name: def.name, state })
            .collect();
        let path = state_path(dir);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&states)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn invokers(&self) -> &Arc<InvokerRegistry> {
        &self.invokers
    }

    /// The in-process invoker; install handlers here for `local` agents.
    pub fn local(&self) -> &Arc<LocalInvoker> {
        &self.local
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn workflows(&self) -> &WorkflowExecutor {
        &self.workflows
    }

    /// Register an agent whose invoker binding resolves.
    pub fn register(&self, def: AgentDefinition) -> Result<AgentState> {
        self.invokers.resolve(&def)?;
        self.registry.register(def)
    }

    pub fn update(&self, name: &str, def: AgentDefinition) -> Result<AgentState> {
        self.invokers.resolve(&def)?;
        self.registry.update(name, def)
    }

    /// Remove an agent; see [`Scheduler::deregister`] for the busy rules.
    pub fn deregister(&self, name: &str, force: bool) -> Result<AgentDefinition> {
        self.scheduler.deregister(name, force)
    }

    /// Read a definition document, naming the agent after the file when
    /// the header has no name.
    pub fn load_document(path: &Path) -> Result<AgentDefinition> {
        let content = std::fs::read_to_string(path)?;
        let stem = path.file_stem().and_then(|s| s.to_str());
        parse_document(&content, stem)
    }

    pub fn submit_task(&self, req: TaskRequest) -> Result<String> {
        self.scheduler.submit(req)
    }

    pub fn task_status(&self, task_id: &str) -> Result<Task> {
        self.scheduler.get_status(task_id)
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<Task> {
        self.scheduler.cancel(task_id)
    }

    pub async fn wait_task(&self, task_id: &str) -> Result<Task> {
        self.scheduler.wait(task_id).await
    }

    pub fn submit_workflow(&self, workflow: Workflow) -> Result<String> {
        self.workflows.submit(workflow)
    }

    pub async fn run_workflow(&self, workflow: Workflow) -> Result<WorkflowResult> {
        self.workflows.execute(workflow).await
    }

    pub fn workflow_result(&self, workflow_id: &str) -> Result<WorkflowResult> {
        self.workflows.result(workflow_id)
    }

    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<WorkflowResult> {
        self.workflows.cancel(workflow_id)
    }

    pub fn export_snapshot(&self) -> RegistrySnapshot {
        self.registry.export_snapshot()
    }

    /// Import a snapshot. Every definition must bind to a known invoker
    /// before anything is registered.
    pub fn import_snapshot(&self, snapshot: &RegistrySnapshot) -> Result<usize> {
        for def in &snapshot.agents {
            self.invokers.resolve(def)?;
        }
        self.registry.import_snapshot(snapshot)
    }

    pub fn health_monitor(&self, probe: Arc<dyn HealthProbe>) -> HealthMonitor {
        HealthMonitor::new(self.registry.clone(), probe, self.config.health_config())
    }
}

fn restore_states(registry: &AgentRegistry, path: &Path) {
    if !path.exists() {
        return;
    }
    let states: Vec<SavedState> = match fs::read_to_string(path)
        .map_err(OrchestratorError::from)
        .and_then(|content| Ok(serde_json::from_str::<Vec<SavedState>>(&content)?))
    {
        Ok(states) => states,
        Err(e) => {
            warn!("Ignoring {}: {}", path.display(), e);
            return;
        }
    };
    // Agents removed by hand since the last save are skipped.
    let unknown = registry.restore(states.into_iter().map(|s| (s.name, s.state)).collect());
    for name in unknown {
        debug!("No stored agent for saved state '{}'", name);
    }
}

/// Refuse to work on a directory that was never initialised.
pub fn ensure_initialized(dir: &Path) -> Result<()> {
    if !agents_dir(dir).is_dir() {
        return Err(OrchestratorError::NotFound(format!(
            "no agentmesh data at {}. Run 'amesh init' first",
            dir.display()
        )));
    }
    Ok(())
}
