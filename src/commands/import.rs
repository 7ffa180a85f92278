use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use agentmesh::registry::RegistrySnapshot;

use super::open;

pub fn run(dir: &Path, file: &Path) -> Result<()> {
    let content =
        fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let snapshot: RegistrySnapshot =
        serde_json::from_str(&content).context("Snapshot is not valid JSON")?;

    let orchestrator = open(dir)?;
    let count = orchestrator.import_snapshot(&snapshot)?;
    orchestrator.persist_state()?;
    println!("Imported {} agent(s)", count);
    Ok(())
}
