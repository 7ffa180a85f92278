use anyhow::Result;
use std::path::Path;

use super::open;

pub fn run(dir: &Path, name: &str, force: bool) -> Result<()> {
    let orchestrator = open(dir)?;
    orchestrator.deregister(name, force)?;
    orchestrator.persist_state()?;
    println!("Deregistered agent: {}", name);
    Ok(())
}
