use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::open;

pub fn run(dir: &Path, file: Option<&Path>) -> Result<()> {
    let orchestrator = open(dir)?;
    let snapshot = orchestrator.export_snapshot();
    let content = serde_json::to_string_pretty(&snapshot)?;

    match file {
        Some(path) => {
            fs::write(path, content + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Exported {} agent(s) to {}",
                snapshot.agents.len(),
                path.display()
            );
        }
        None => println!("{}", content),
    }
    Ok(())
}
