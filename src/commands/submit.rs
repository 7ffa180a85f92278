//! Run one task on an agent.
//!
//! Agents run inside this process, so the command always stays until the
//! task is terminal. The task id is printed as soon as the task is queued;
//! `--wait` also prints the finished task and turns a non-successful
//! outcome into a non-zero exit.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

use agentmesh::scheduler::{TaskRequest, TaskState};

use super::open;

pub fn parse_context(context: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = context else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--context must be a JSON object, got {}", other),
    }
}

pub async fn run(
    dir: &Path,
    agent: &str,
    instruction: &str,
    context: Option<&str>,
    timeout: Option<u64>,
    wait: bool,
    json: bool,
) -> Result<()> {
    let orchestrator = open(dir)?;
    let mut request = TaskRequest::new(agent, instruction).with_context(parse_context(context)?);
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let task_id = orchestrator.submit_task(request)?;
    if !wait && !json {
        println!("{}", task_id);
    }
    let task = orchestrator.wait_task(&task_id).await?;
    orchestrator.persist_state()?;

    if !wait {
        if json {
            println!("{}", serde_json::json!({ "id": task.id, "state": task.state }));
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Task {} {}", task.id, task.state);
        match (&task.result, &task.error) {
            (Some(Value::String(s)), _) => println!("{}", s),
            (Some(result), _) => println!("{}", serde_json::to_string_pretty(result)?),
            (None, Some(error)) => println!("Error: {}", error),
            (None, None) => {}
        }
    }
    if task.state != TaskState::Succeeded {
        anyhow::bail!(
            "Task {} {}: {}",
            task.id,
            task.state,
            task.error.unwrap_or_default()
        );
    }
    Ok(())
}
