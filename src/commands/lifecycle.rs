//! Administrative lifecycle changes: reset, start and stop.

use anyhow::Result;
use std::path::Path;

use super::open;

#[derive(Debug, Clone, Copy)]
pub enum Action {
    Reset,
    Start,
    Stop,
}

pub fn run(dir: &Path, name: &str, action: Action, json: bool) -> Result<()> {
    let orchestrator = open(dir)?;
    let registry = orchestrator.registry();
    let state = match action {
        Action::Reset => registry.reset(name)?,
        Action::Start => registry.start(name)?,
        Action::Stop => registry.stop(name)?,
    };
    orchestrator.persist_state()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("{}: {}", name, state.lifecycle);
    }
    Ok(())
}
