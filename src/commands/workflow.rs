use anyhow::{Context, Result};
use std::path::Path;

use agentmesh::workflow::{StepState, Workflow, WorkflowResult, WorkflowStatus};

use super::open;

pub async fn run(dir: &Path, file: &Path, dry_run: bool, json: bool) -> Result<()> {
    let workflow =
        Workflow::load(file).with_context(|| format!("Failed to read workflow {}", file.display()))?;
    let orchestrator = open(dir)?;

    if dry_run {
        let layers = orchestrator.workflows().validate(&workflow)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&layers)?);
        } else {
            for (i, layer) in layers.iter().enumerate() {
                println!("Layer {}: {}", i + 1, layer.join(", "));
            }
        }
        return Ok(());
    }

    let result = orchestrator.run_workflow(workflow).await?;
    orchestrator.persist_state()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    match result.status {
        WorkflowStatus::Failed | WorkflowStatus::Cancelled => anyhow::bail!(
            "Workflow {} {}: {}",
            result.workflow_id,
            result.status,
            result.error.unwrap_or_default()
        ),
        _ => Ok(()),
    }
}

fn print_result(result: &WorkflowResult) {
    println!("Workflow {} {}", result.workflow_id, result.status);
    for layer in &result.layers {
        for id in layer {
            let Some(step) = result.steps.get(id) else {
                continue;
            };
            let marker = match step.state {
                StepState::Succeeded => "[x]",
                StepState::Skipped => "[-]",
                StepState::Pending | StepState::Running => "[ ]",
                _ => "[F]",
            };
            let agent = step.agent.as_deref().unwrap_or("-");
            match step.error {
                Some(ref error) => println!("  {} {} ({}): {}", marker, id, agent, error),
                None => println!("  {} {} ({})", marker, id, agent),
            }
        }
    }
    if !result.failures.is_empty() {
        println!();
        println!("{} failure(s)", result.failures.len());
    }
}
