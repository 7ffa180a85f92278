//! Agent invocation layer
//!
//! The scheduler never runs an agent itself; it hands each task to an
//! [`AgentInvoker`]. This module includes:
//! - The invoker trait and the registry that routes agents to invokers
//! - In-process handlers (`local`)
//! - Shell command executors configured from TOML (`shell`)
//! - Remote agent services over HTTP (`http`), plus the matching health probe

pub mod executor;
pub mod http;
pub mod local;
pub mod shell;

pub use executor::{
    AgentInvoker, ExecutorConfig, ExecutorSettings, Invocation, InvokerRegistry, TemplateVars,
};
pub use http::{HttpInvoker, HttpProbe};
pub use local::LocalInvoker;
pub use shell::ShellInvoker;
