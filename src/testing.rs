//! Helpers shared by the integration tests (`test-support` feature).

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::definition::AgentDefinition;
use crate::error::OrchestratorError;
use crate::health::{HealthProbe, ProbeOutcome};
use crate::orchestrator::Orchestrator;
use crate::registry::AgentRegistry;
use crate::service::LocalInvoker;

/// Probe whose answer per agent is set by the test. Agents without an
/// answer are healthy.
#[derive(Default)]
pub struct ScriptedProbe {
    answers: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_healthy(&self, agent: &str, healthy: bool) {
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent.to_string(), healthy);
    }

    /// Agents probed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, agent: &AgentDefinition) -> ProbeOutcome {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(agent.name.clone());
        let healthy = self
            .answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&agent.name)
            .copied()
            .unwrap_or(true);
        if healthy {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Unhealthy(format!("{} is scripted to fail", agent.name))
        }
    }
}

/// Install a handler that understands a tiny instruction language:
/// `sleep:<ms>` sleeps then echoes, `fail:<msg>` fails, `hang` waits for
/// cancellation, anything else is echoed back with the task context.
pub fn install_script_handler(local: &LocalInvoker, agent: &str) {
    local.register(agent, |call, cancel| async move {
        let instruction = call.instruction.clone();
        if let Some(ms) = instruction.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        } else if let Some(msg) = instruction.strip_prefix("fail:") {
            return Err(OrchestratorError::Invocation(msg.to_string()));
        } else if instruction == "hang" {
            cancel.cancelled().await;
            return Err(OrchestratorError::Invocation("stopped".to_string()));
        }
        Ok(json!({
            "agent": call.agent.name,
            "instruction": instruction,
            "context": Value::Object(call.context),
        }))
    });
}

/// In-memory orchestrator with the given agents registered, each served by
/// the scripted handler.
pub fn scripted_orchestrator(agents: Vec<AgentDefinition>) -> Orchestrator {
    scripted_orchestrator_with(Config::default(), agents)
}

/// [`scripted_orchestrator`] with explicit configuration.
pub fn scripted_orchestrator_with(config: Config, agents: Vec<AgentDefinition>) -> Orchestrator {
    let orchestrator = Orchestrator::new(Arc::new(AgentRegistry::in_memory()), config);
    for def in agents {
        install_script_handler(orchestrator.local(), &def.name);
        orchestrator
            .register(def)
            .unwrap_or_else(|e| panic!("test agent rejected: {}", e));
    }
    orchestrator
}
