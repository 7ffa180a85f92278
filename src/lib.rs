pub mod check;
pub mod config;
pub mod definition;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod workflow;

#[cfg(feature = "test-support")]
pub mod testing;

pub use check::{DependencyGraph, check_cycles, check_orphans};
pub use config::Config;
pub use definition::{AgentDefinition, ResourceLimits, TriggerType, parse_document, render_document};
pub use error::{OrchestratorError, Result};
pub use health::{HealthConfig, HealthMonitor, HealthProbe, ProbeOutcome};
pub use orchestrator::Orchestrator;
pub use registry::{AgentRegistry, AgentState, Lifecycle, RegistrySnapshot};
pub use scheduler::{Scheduler, SchedulerConfig, Task, TaskRequest, TaskState};
pub use service::{
    AgentInvoker, ExecutorConfig, HttpInvoker, HttpProbe, Invocation, InvokerRegistry,
    LocalInvoker, ShellInvoker,
};
pub use store::{DefinitionStore, DirStore, MemoryStore};
pub use workflow::{
    FailurePolicy, StepResult, StepState, Workflow, WorkflowExecutor, WorkflowResult,
    WorkflowStatus, WorkflowStep,
};
