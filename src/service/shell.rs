//! Shell executor for running commands as agents.
//!
//! The command line comes from an [`ExecutorConfig`] with the task's
//! template variables substituted. The agent's own `environment_vars` are
//! exported to the process as well. Stdout is the task result: parsed as
//! JSON when it is valid JSON, otherwise returned as a string.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::executor::{AgentInvoker, ExecutorConfig, Invocation, TemplateVars};
use crate::error::{OrchestratorError, Result};

pub struct ShellInvoker {
    name: String,
    config: ExecutorConfig,
}

impl ShellInvoker {
    pub fn new(name: &str, config: ExecutorConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }

    fn command(&self, call: &Invocation) -> Command {
        let vars = TemplateVars::from_invocation(call);
        let settings = self.config.apply_templates(&vars);

        let mut cmd = Command::new(&settings.command);
        cmd.args(&settings.args);
        for (key, value) in &call.agent.environment_vars {
            cmd.env(key, value);
        }
        for (key, value) in &settings.env {
            cmd.env(key, value);
        }
        if let Some(ref wd) = settings.working_dir {
            cmd.current_dir(wd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // The child dies with the future when the scheduler stops waiting.
        cmd.kill_on_drop(true);
        cmd
    }
}

fn parse_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout).trim().to_string();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl AgentInvoker for ShellInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, call: &Invocation, cancel: CancellationToken) -> Result<Value> {
        let child = self.command(call).spawn().map_err(|e| {
            OrchestratorError::Invocation(format!(
                "failed to spawn '{}': {}",
                self.config.executor.command, e
            ))
        })?;

        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Invocation("cancelled".to_string()));
            }
        };

        if output.status.success() {
            Ok(parse_output(&output.stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(OrchestratorError::Invocation(format!(
                "command exited with {}{}",
                output.status,
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!(": {}", stderr)
                }
            )))
        }
    }
}
