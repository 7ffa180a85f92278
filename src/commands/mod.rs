pub mod agents;
pub mod deregister;
pub mod export;
pub mod health;
pub mod import;
pub mod init;
pub mod lifecycle;
pub mod register;
pub mod show;
pub mod submit;
pub mod workflow;

use anyhow::{Context, Result};
use std::path::Path;

use agentmesh::orchestrator::{Orchestrator, ensure_initialized};

/// Open an initialised data directory.
pub fn open(dir: &Path) -> Result<Orchestrator> {
    ensure_initialized(dir)?;
    Orchestrator::open(dir).with_context(|| format!("Failed to open {}", dir.display()))
}

/// Short one-line form of an agent's capabilities.
pub fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
