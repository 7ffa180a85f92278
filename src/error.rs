use thiserror::Error;

use crate::registry::Lifecycle;
use crate::scheduler::TaskState;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("Agent '{agent}' is unavailable ({lifecycle})")]
    AgentUnavailable { agent: String, lifecycle: Lifecycle },
    #[error("Agent '{agent}' has {in_flight} in-flight task(s)")]
    AgentBusy { agent: String, in_flight: usize },
    #[error("Task '{task_id}' is already {state}")]
    InvalidState { task_id: String, state: TaskState },
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Step '{step}' depends on unknown step '{missing}'")]
    UnresolvedStep { step: String, missing: String },
    #[error("Step '{step}' requires capability '{capability}' but no agent provides it")]
    NoAgentForCapability { step: String, capability: String },
    #[error("Task exceeded its deadline of {0} ms")]
    TaskTimeout(u64),
    #[error("Invocation failed: {0}")]
    Invocation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
