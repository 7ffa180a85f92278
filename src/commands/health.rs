//! Probe agent health over HTTP.
//!
//! `--once` runs a single round. Without it the command loops on the
//! configured interval until interrupted, saving lifecycle state after
//! every round.

use anyhow::Result;
use log::warn;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use agentmesh::health::Transition;
use agentmesh::service::HttpProbe;

use super::open;

pub async fn run(dir: &Path, once: bool, json: bool) -> Result<()> {
    let orchestrator = open(dir)?;
    let monitor = orchestrator.health_monitor(Arc::new(HttpProbe::new()));

    if once {
        let transitions = monitor.tick().await;
        orchestrator.persist_state()?;
        report(&orchestrator, &transitions, json)?;
        return Ok(());
    }

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        }
    });
    monitor
        .run(token, |transitions| {
            // A failed save is retried on the next round.
            if let Err(e) = orchestrator.persist_state() {
                warn!("Could not save agent state: {}", e);
            }
            for t in transitions {
                if json {
                    println!("{}", serde_json::json!({ "agent": t.agent, "from": t.from, "to": t.to }));
                } else {
                    println!("{}: {} -> {}", t.agent, t.from, t.to);
                }
            }
        })
        .await;
    Ok(())
}

fn report(orchestrator: &agentmesh::Orchestrator, transitions: &[Transition], json: bool) -> Result<()> {
    let agents = orchestrator.registry().list(None);
    if json {
        let output: Vec<_> = agents
            .iter()
            .map(|(def, state)| {
                let changed = transitions.iter().find(|t| t.agent == def.name);
                serde_json::json!({
                    "name": def.name,
                    "lifecycle": state.lifecycle,
                    "consecutive_failures": state.consecutive_failures,
                    "changed_from": changed.map(|t| t.from),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    for (def, state) in &agents {
        match transitions.iter().find(|t| t.agent == def.name) {
            Some(t) => println!("{}: {} -> {}", def.name, t.from, t.to),
            None => println!("{}: {}", def.name, state.lifecycle),
        }
    }
    Ok(())
}
