//! Invoker plugin system for running agents.
//!
//! Invokers define how an agent is run. An agent picks its invoker by name
//! through `executor` in its definition; agents with an `endpoint` default
//! to `http`, everything else to `local`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::definition::AgentDefinition;
use crate::error::{OrchestratorError, Result};

/// Everything an invoker gets to see about a task.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task_id: String,
    pub agent: AgentDefinition,
    pub instruction: String,
    pub context: Map<String, Value>,
    pub deadline: Option<DateTime<Utc>>,
}

impl Invocation {
    /// Seconds left until the deadline, if there is one.
    pub fn remaining_secs(&self) -> Option<u64> {
        self.deadline
            .map(|d| (d - Utc::now()).num_seconds().max(0) as u64)
    }
}

/// Trait for invoker plugins.
///
/// Implementations should stop work when `cancel` fires, but the scheduler
/// does not rely on it: it stops waiting either way.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Get the name of this invoker.
    fn name(&self) -> &str;

    /// Run one task and return its result.
    async fn invoke(&self, call: &Invocation, cancel: CancellationToken) -> Result<Value>;
}

/// Template variables that can be used in executor configurations.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub task_id: String,
    pub agent_name: String,
    pub instruction: String,
    pub context: String,
    pub agent_instructions: String,
}

impl TemplateVars {
    /// Create template variables from an invocation.
    pub fn from_invocation(call: &Invocation) -> Self {
        Self {
            task_id: call.task_id.clone(),
            agent_name: call.agent.name.clone(),
            instruction: call.instruction.clone(),
            context: Value::Object(call.context.clone()).to_string(),
            agent_instructions: call.agent.instructions.clone(),
        }
    }

    /// Apply template substitution to a string.
    pub fn apply(&self, template: &str) -> String {
        template
            .replace("{{task_id}}", &self.task_id)
            .replace("{{agent_name}}", &self.agent_name)
            .replace("{{instruction}}", &self.instruction)
            .replace("{{context}}", &self.context)
            .replace("{{agent_instructions}}", &self.agent_instructions)
    }
}

/// Configuration for a command executor, loaded from
/// `<dir>/executors/<name>.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// The executor configuration section.
    pub executor: ExecutorSettings,
}

/// Settings within an executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Command to execute.
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the executor (optional).
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ExecutorConfig {
    /// Load executor configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ExecutorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// The built-in `shell` executor: runs the instruction with `bash -c`.
    pub fn default_shell() -> Self {
        let mut env = HashMap::new();
        env.insert("TASK_ID".to_string(), "{{task_id}}".to_string());
        env.insert("AGENT_NAME".to_string(), "{{agent_name}}".to_string());
        env.insert("TASK_CONTEXT".to_string(), "{{context}}".to_string());
        Self {
            executor: ExecutorSettings {
                command: "bash".to_string(),
                args: vec!["-c".to_string(), "{{instruction}}".to_string()],
                env,
                working_dir: None,
            },
        }
    }

    /// Apply template variables to all configurable fields.
    pub fn apply_templates(&self, vars: &TemplateVars) -> ExecutorSettings {
        let mut settings = self.executor.clone();

        settings.command = vars.apply(&settings.command);
        settings.args = settings.args.iter().map(|arg| vars.apply(arg)).collect();
        settings.env = settings
            .env
            .iter()
            .map(|(k, v)| (k.clone(), vars.apply(v)))
            .collect();
        if let Some(ref wd) = settings.working_dir {
            settings.working_dir = Some(vars.apply(wd));
        }

        settings
    }
}

pub fn executors_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("executors")
}

/// Routes each agent to the invoker named by its definition.
///
/// The registry is itself an [`AgentInvoker`], so the scheduler only ever
/// holds one invoker.
#[derive(Default)]
pub struct InvokerRegistry {
    invokers: RwLock<HashMap<String, Arc<dyn AgentInvoker>>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoker under its own name, replacing any previous one.
    pub fn register(&self, invoker: Arc<dyn AgentInvoker>) {
        let mut invokers = self.invokers.write().unwrap_or_else(|e| e.into_inner());
        invokers.insert(invoker.name().to_string(), invoker);
    }

    /// Get an invoker by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentInvoker>> {
        let invokers = self.invokers.read().unwrap_or_else(|e| e.into_inner());
        invokers.get(name).cloned()
    }

    /// List available invoker names, sorted.
    pub fn available(&self) -> Vec<String> {
        let invokers = self.invokers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = invokers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the invoker an agent is bound to.
    pub fn binding_for(def: &AgentDefinition) -> &str {
        match (&def.executor, &def.endpoint) {
            (Some(name), _) => name.as_str(),
            (None, Some(_)) => "http",
            (None, None) => "local",
        }
    }

    /// Resolve the invoker for an agent.
    pub fn resolve(&self, def: &AgentDefinition) -> Result<Arc<dyn AgentInvoker>> {
        let name = Self::binding_for(def);
        self.get(name).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "agent '{}' uses executor '{}', available: {:?}",
                def.name,
                name,
                self.available()
            ))
        })
    }

    /// Register a shell invoker for every `executors/*.toml` file.
    pub fn load_executors(&self, data_dir: &Path) -> Result<usize> {
        let dir = executors_dir(data_dir);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let config = ExecutorConfig::load(&path)?;
            self.register(Arc::new(crate::service::shell::ShellInvoker::new(name, config)));
            count += 1;
        }
        Ok(count)
    }

    /// Ensure the executors directory exists and has a default shell config.
    pub fn init(data_dir: &Path) -> Result<()> {
        let dir = executors_dir(data_dir);
        fs::create_dir_all(&dir)?;
        let config_path = dir.join("shell.toml");
        if !config_path.exists() {
            let content = toml::to_string_pretty(&ExecutorConfig::default_shell())
                .map_err(|e| OrchestratorError::Validation(e.to_string()))?;
            fs::write(&config_path, content)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentInvoker for InvokerRegistry {
    fn name(&self) -> &str {
        "router"
    }

    async fn invoke(&self, call: &Invocation, cancel: CancellationToken) -> Result<Value> {
        let invoker = self.resolve(&call.agent)?;
        invoker.invoke(call, cancel).await
    }
}
