//! Health monitor.
//!
//! Probes every agent that is not Stopped or Failed on a fixed interval and
//! feeds the outcome into the registry, which owns the lifecycle rules.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::definition::AgentDefinition;
use crate::registry::{AgentRegistry, Lifecycle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Checks whether one agent is able to take work.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, agent: &AgentDefinition) -> ProbeOutcome;
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Consecutive failed probes after which a Degraded agent is Failed.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

/// A lifecycle change observed during one probing round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub agent: String,
    pub from: Lifecycle,
    pub to: Lifecycle,
}

pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, probe: Arc<dyn HealthProbe>, config: HealthConfig) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe every eligible agent once, in registration order.
    pub async fn tick(&self) -> Vec<Transition> {
        let targets: Vec<(AgentDefinition, Lifecycle)> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|(_, state)| state.lifecycle.is_probed())
            .map(|(def, state)| (def, state.lifecycle))
            .collect();

        let mut transitions = Vec::new();
        for (def, before) in targets {
            let outcome = self.probe.probe(&def).await;
            if let ProbeOutcome::Unhealthy(ref reason) = outcome {
                warn!("Health probe failed for '{}': {}", def.name, reason);
            }
            // The agent may have been deregistered, stopped or reset while
            // we were probing.
            let after = match self.registry.record_probe(
                &def.name,
                outcome.is_healthy(),
                self.config.failure_threshold,
            ) {
                Ok(lifecycle) => lifecycle,
                Err(e) => {
                    debug!("Dropping probe result for '{}': {}", def.name, e);
                    continue;
                }
            };
            if after != before {
                transitions.push(Transition {
                    agent: def.name.clone(),
                    from: before,
                    to: after,
                });
            }
        }
        transitions
    }

    /// Probe on every interval until `token` is cancelled, handing each
    /// round's transitions to `on_round`.
    pub async fn run<F>(&self, token: CancellationToken, mut on_round: F)
    where
        F: FnMut(&[Transition]),
    {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Health monitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    let changes = self.tick().await;
                    debug!("Health round complete, {} transition(s)", changes.len());
                    on_round(&changes);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Probe whose answers are set per agent by the test.
    #[derive(Default)]
    struct ScriptedProbe {
        healthy: Mutex<HashMap<String, bool>>,
    }

    impl ScriptedProbe {
        fn set(&self, agent: &str, healthy: bool) {
            self.healthy.lock().unwrap().insert(agent.to_string(), healthy);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, agent: &AgentDefinition) -> ProbeOutcome {
            if self.healthy.lock().unwrap().get(&agent.name).copied().unwrap_or(true) {
                ProbeOutcome::Healthy
            } else {
                ProbeOutcome::Unhealthy("scripted".to_string())
            }
        }
    }

    fn setup() -> (Arc<AgentRegistry>, Arc<ScriptedProbe>, HealthMonitor) {
        let registry = Arc::new(AgentRegistry::in_memory());
        registry.register(AgentDefinition::new("a")).unwrap();
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(registry.clone(), probe.clone(), HealthConfig::default());
        (registry, probe, monitor)
    }

    #[tokio::test]
    async fn test_threshold_walks_through_degraded() {
        let (registry, probe, monitor) = setup();
        monitor.tick().await;
        assert_eq!(registry.state("a").unwrap().lifecycle, Lifecycle::Running);

        probe.set("a", false);
        let t = monitor.tick().await;
        assert_eq!(t[0].to, Lifecycle::Degraded);
        monitor.tick().await;
        assert_eq!(registry.state("a").unwrap().lifecycle, Lifecycle::Degraded);
        let t = monitor.tick().await;
        assert_eq!(
            t,
            vec![Transition {
                agent: "a".to_string(),
                from: Lifecycle::Degraded,
                to: Lifecycle::Failed,
            }]
        );
        assert_eq!(registry.state("a").unwrap().consecutive_failures, 3);

        // Failed agents are no longer probed.
        probe.set("a", true);
        assert!(monitor.tick().await.is_empty());
        assert_eq!(registry.state("a").unwrap().lifecycle, Lifecycle::Failed);
    }

    #[tokio::test]
    async fn test_recovery_from_degraded() {
        let (registry, probe, monitor) = setup();
        monitor.tick().await;
        probe.set("a", false);
        monitor.tick().await;
        monitor.tick().await;
        probe.set("a", true);
        monitor.tick().await;
        let state = registry.state("a").unwrap();
        assert_eq!(state.lifecycle, Lifecycle::Running);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_health_check.is_some());
    }

    /// Probe that takes its agent out of service before answering.
    struct StoppingProbe {
        registry: Arc<AgentRegistry>,
    }

    #[async_trait]
    impl HealthProbe for StoppingProbe {
        async fn probe(&self, agent: &AgentDefinition) -> ProbeOutcome {
            self.registry.stop(&agent.name).unwrap();
            ProbeOutcome::Healthy
        }
    }

    #[tokio::test]
    async fn test_stop_during_health_check_is_kept() {
        let (registry, _probe, _monitor) = setup();
        let monitor = HealthMonitor::new(
            registry.clone(),
            Arc::new(StoppingProbe {
                registry: registry.clone(),
            }),
            HealthConfig::default(),
        );
        assert!(monitor.tick().await.is_empty());
        let state = registry.state("a").unwrap();
        assert_eq!(state.lifecycle, Lifecycle::Stopped);
        assert!(state.last_health_check.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (registry, _probe, monitor) = setup();
        let monitor = HealthMonitor::new(
            registry.clone(),
            Arc::new(ScriptedProbe::default()),
            HealthConfig {
                interval: Duration::from_millis(10),
                ..monitor.config().clone()
            },
        );
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut rounds = 0;
            monitor.run(child, |_| rounds += 1).await;
            rounds
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        assert!(handle.await.unwrap() >= 2);
        assert_eq!(registry.state("a").unwrap().lifecycle, Lifecycle::Running);
    }
}
