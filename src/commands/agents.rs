//! List registered agents
//!
//! Usage:
//!   amesh agents                       # Table of all agents
//!   amesh agents --trigger on_demand   # Only on-demand agents
//!   amesh agents --json                # Output as JSON for scripting

use anyhow::{Context, Result};
use std::path::Path;

use agentmesh::definition::{AgentDefinition, TriggerType};
use agentmesh::registry::{AgentState, Lifecycle};

use super::{join_or_dash, open};

pub fn run(dir: &Path, trigger: Option<&str>, json: bool) -> Result<()> {
    let trigger: Option<TriggerType> = trigger
        .map(|t| t.parse())
        .transpose()
        .context("Invalid --trigger")?;

    let orchestrator = open(dir)?;
    let agents = orchestrator.registry().list(trigger);

    if json {
        output_json(&agents)
    } else {
        output_table(&agents)
    }
}

fn output_json(agents: &[(AgentDefinition, AgentState)]) -> Result<()> {
    let output: Vec<_> = agents
        .iter()
        .map(|(def, state)| {
            serde_json::json!({
                "name": def.name,
                "description": def.description,
                "trigger_type": def.trigger_type,
                "capabilities": def.capabilities,
                "dependencies": def.dependencies,
                "executor": agentmesh::InvokerRegistry::binding_for(def),
                "lifecycle": state.lifecycle,
                "consecutive_failures": state.consecutive_failures,
                "last_health_check": state.last_health_check,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn output_table(agents: &[(AgentDefinition, AgentState)]) -> Result<()> {
    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }

    let name_width = agents
        .iter()
        .map(|(d, _)| d.name.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<name_width$}  {:<10}  {:<10}  {}",
        "NAME",
        "STATE",
        "TRIGGER",
        "CAPABILITIES",
        name_width = name_width,
    );

    for (def, state) in agents {
        println!(
            "{:<name_width$}  {:<10}  {:<10}  {}",
            def.name,
            state.lifecycle.to_string(),
            def.trigger_type.to_string(),
            join_or_dash(&def.capabilities),
            name_width = name_width,
        );
    }

    let failed = agents
        .iter()
        .filter(|(_, s)| s.lifecycle == Lifecycle::Failed)
        .count();
    println!();
    if failed > 0 {
        println!("{} agent(s), {} failed", agents.len(), failed);
    } else {
        println!("{} agent(s)", agents.len());
    }

    Ok(())
}
