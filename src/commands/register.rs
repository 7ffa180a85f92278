use anyhow::{Context, Result};
use std::path::Path;

use agentmesh::orchestrator::Orchestrator;

use super::open;

pub fn run(dir: &Path, file: &Path, update: bool, json: bool) -> Result<()> {
    let def = Orchestrator::load_document(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = def.name.clone();

    let orchestrator = open(dir)?;
    let state = if update {
        orchestrator.update(&name, def)?
    } else {
        orchestrator.register(def)?
    };
    orchestrator.persist_state()?;

    if json {
        let output = serde_json::json!({
            "name": name,
            "updated": update,
            "state": state,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if update {
        println!("Updated agent: {} ({})", name, state.lifecycle);
    } else {
        println!("Registered agent: {}", name);
    }
    Ok(())
}
