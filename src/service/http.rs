//! Remote agent services.
//!
//! A remote agent exposes `POST /execute` taking
//! `{"instruction", "context", "timeout"}` and answering
//! `{"status": "success" | "error", "result", "error"}`, and `GET /health`
//! answering 200 while it is able to take work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::executor::{AgentInvoker, Invocation};
use crate::definition::AgentDefinition;
use crate::error::{OrchestratorError, Result};
use crate::health::{HealthProbe, ProbeOutcome};

/// Timeout sent to the remote side when the task has no deadline.
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 300;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    instruction: &'a str,
    context: &'a Map<String, Value>,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

fn endpoint_url(def: &AgentDefinition, path: &str) -> Result<String> {
    let base = def.endpoint.as_deref().ok_or_else(|| {
        OrchestratorError::Invocation(format!("agent '{}' has no endpoint", def.name))
    })?;
    Ok(format!("{}/{}", base.trim_end_matches('/'), path))
}

#[derive(Clone, Default)]
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn execute(&self, call: &Invocation) -> Result<Value> {
        let url = endpoint_url(&call.agent, "execute")?;
        let timeout = call.remaining_secs().unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS);
        let body = ExecuteRequest {
            instruction: &call.instruction,
            context: &call.context,
            timeout,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::Invocation(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::Invocation(format!(
                "POST {} returned {}",
                url, status
            )));
        }

        let reply: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Invocation(format!("bad reply from {}: {}", url, e)))?;
        interpret(reply)
    }
}

fn interpret(reply: ExecuteResponse) -> Result<Value> {
    if reply.status == "success" {
        Ok(reply.result)
    } else {
        Err(OrchestratorError::Invocation(reply.error.unwrap_or_else(|| {
            format!("remote agent reported status '{}'", reply.status)
        })))
    }
}

#[async_trait]
impl AgentInvoker for HttpInvoker {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, call: &Invocation, cancel: CancellationToken) -> Result<Value> {
        tokio::select! {
            res = self.execute(call) => res,
            _ = cancel.cancelled() => Err(OrchestratorError::Invocation("cancelled".to_string())),
        }
    }
}

/// Probes `GET <endpoint>/health`. Agents without an endpoint run in
/// process and are always considered healthy.
#[derive(Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, agent: &AgentDefinition) -> ProbeOutcome {
        if agent.endpoint.is_none() {
            return ProbeOutcome::Healthy;
        }
        let url = match endpoint_url(agent, "health") {
            Ok(url) => url,
            Err(e) => return ProbeOutcome::Unhealthy(e.to_string()),
        };
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Healthy,
            Ok(resp) => ProbeOutcome::Unhealthy(format!("GET {} returned {}", url, resp.status())),
            Err(e) => ProbeOutcome::Unhealthy(format!("GET {}: {}", url, e)),
        }
    }
}
