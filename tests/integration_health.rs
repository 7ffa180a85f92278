//! Integration tests for the health monitor and the lifecycle transitions
//! it drives.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use agentmesh::definition::AgentDefinition;
use agentmesh::health::{HealthConfig, HealthMonitor};
use agentmesh::registry::Lifecycle;
use agentmesh::scheduler::TaskRequest;
use agentmesh::testing::{ScriptedProbe, scripted_orchestrator};

fn pair() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new("alpha").with_capabilities(&["search"]),
        AgentDefinition::new("beta").with_capabilities(&["search"]),
    ]
}

#[tokio::test]
async fn repeated_failures_walk_through_degraded_to_failed() {
    let orch = scripted_orchestrator(pair());
    let probe = ScriptedProbe::new();
    let monitor = orch.health_monitor(probe.clone());
    let registry = orch.registry();

    monitor.tick().await;
    assert_eq!(registry.state("alpha").unwrap().lifecycle, Lifecycle::Running);

    probe.set_healthy("alpha", false);
    let mut seen = vec![Lifecycle::Running];
    for _ in 0..monitor.config().failure_threshold {
        monitor.tick().await;
        seen.push(registry.state("alpha").unwrap().lifecycle);
    }
    assert_eq!(
        seen,
        vec![
            Lifecycle::Running,
            Lifecycle::Degraded,
            Lifecycle::Degraded,
            Lifecycle::Failed
        ]
    );
    assert_eq!(registry.state("beta").unwrap().lifecycle, Lifecycle::Running);

    // Failed agents are no longer probed or offered for their capability.
    let calls_before = probe.calls().len();
    let transitions = monitor.tick().await;
    assert!(transitions.is_empty());
    assert_eq!(probe.calls().len(), calls_before + 1);
    assert_eq!(registry.lookup_by_capability("search").len(), 1);
    assert!(orch.submit_task(TaskRequest::new("alpha", "x")).is_err());
}

#[tokio::test]
async fn one_failed_probe_never_jumps_to_failed() {
    let orch = scripted_orchestrator(pair());
    let probe = ScriptedProbe::new();
    let monitor = HealthMonitor::new(
        orch.registry().clone(),
        probe.clone(),
        HealthConfig {
            interval: Duration::from_secs(30),
            failure_threshold: 1,
        },
    );

    monitor.tick().await;
    probe.set_healthy("alpha", false);
    let transitions = monitor.tick().await;
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].from, Lifecycle::Running);
    assert_eq!(transitions[0].to, Lifecycle::Degraded);

    monitor.tick().await;
    assert_eq!(orch.registry().state("alpha").unwrap().lifecycle, Lifecycle::Failed);
}

#[tokio::test]
async fn recovery_clears_failures_and_reset_revives() {
    let orch = scripted_orchestrator(pair());
    let probe = ScriptedProbe::new();
    let monitor = orch.health_monitor(probe.clone());
    let registry = orch.registry();

    probe.set_healthy("beta", false);
    monitor.tick().await;
    monitor.tick().await;
    assert_eq!(registry.state("beta").unwrap().lifecycle, Lifecycle::Degraded);
    assert_eq!(registry.state("beta").unwrap().consecutive_failures, 2);

    probe.set_healthy("beta", true);
    monitor.tick().await;
    let state = registry.state("beta").unwrap();
    assert_eq!(state.lifecycle, Lifecycle::Running);
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_health_check.is_some());

    probe.set_healthy("beta", false);
    for _ in 0..3 {
        monitor.tick().await;
    }
    assert_eq!(registry.state("beta").unwrap().lifecycle, Lifecycle::Failed);

    registry.reset("beta").unwrap();
    probe.set_healthy("beta", true);
    monitor.tick().await;
    assert_eq!(registry.state("beta").unwrap().lifecycle, Lifecycle::Running);
}

#[tokio::test]
async fn stopped_agents_are_not_probed() {
    let orch = scripted_orchestrator(pair());
    let probe = ScriptedProbe::new();
    let monitor = orch.health_monitor(probe.clone());

    orch.registry().stop("alpha").unwrap();
    monitor.tick().await;
    assert_eq!(probe.calls(), vec!["beta".to_string()]);
    assert_eq!(orch.registry().state("alpha").unwrap().lifecycle, Lifecycle::Stopped);
}

#[tokio::test]
async fn background_monitor_probes_until_cancelled() {
    let orch = scripted_orchestrator(pair());
    let probe = ScriptedProbe::new();
    let monitor = HealthMonitor::new(
        orch.registry().clone(),
        probe.clone(),
        HealthConfig {
            interval: Duration::from_millis(10),
            failure_threshold: 3,
        },
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move {
            let mut rounds = 0usize;
            monitor.run(token, |_| rounds += 1).await;
            rounds
        }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();
    let rounds = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor did not stop")
        .unwrap();

    assert!(rounds >= 2);
    assert_eq!(probe.calls().len(), rounds * 2);
    assert_eq!(orch.registry().state("alpha").unwrap().lifecycle, Lifecycle::Running);
}
