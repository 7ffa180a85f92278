use anyhow::Result;
use std::path::Path;

use agentmesh::service::InvokerRegistry;

use super::{join_or_dash, open};

pub fn run(dir: &Path, name: &str, json: bool) -> Result<()> {
    let orchestrator = open(dir)?;
    let (def, state) = orchestrator.registry().get(name)?;

    if json {
        let output = serde_json::json!({
            "definition": def,
            "state": state,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Agent: {}", def.name);
    println!("Description: {}", def.description);
    println!("Trigger: {}", def.trigger_type);
    println!("Executor: {}", InvokerRegistry::binding_for(&def));
    println!("Capabilities: {}", join_or_dash(&def.capabilities));
    println!("Dependencies: {}", join_or_dash(&def.dependencies));
    println!(
        "Limits: memory {}, cpu {}, concurrency {}",
        def.resource_limits.memory, def.resource_limits.cpu, def.resource_limits.concurrency
    );
    if let Some(ref endpoint) = def.endpoint {
        println!("Endpoint: {}", endpoint);
    }
    if let Some(ref image) = def.container_image {
        println!("Image: {}", image);
    }
    if !def.environment_vars.is_empty() {
        println!("Environment:");
        for (key, value) in &def.environment_vars {
            println!("  {}={}", key, value);
        }
    }
    println!();
    println!("State: {}", state.lifecycle);
    println!("Consecutive failures: {}", state.consecutive_failures);
    match state.last_health_check {
        Some(at) => println!("Last health check: {}", at.to_rfc3339()),
        None => println!("Last health check: never"),
    }
    if !def.instructions.is_empty() {
        println!();
        println!("{}", def.instructions);
    }
    Ok(())
}
