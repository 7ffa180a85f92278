//! Integration tests for the task scheduler: per-agent FIFO ordering,
//! concurrency limits, timeouts and cancellation.

use std::time::Duration;

use agentmesh::definition::AgentDefinition;
use agentmesh::error::OrchestratorError;
use agentmesh::registry::Lifecycle;
use agentmesh::scheduler::{TaskRequest, TaskState};
use agentmesh::testing::scripted_orchestrator;

fn worker(name: &str, concurrency: u32) -> AgentDefinition {
    AgentDefinition::new(name)
        .with_capabilities(&["work"])
        .with_concurrency(concurrency)
}

#[tokio::test]
async fn single_slot_agent_runs_tasks_in_submission_order() {
    let orch = scripted_orchestrator(vec![worker("serial", 1)]);

    let ids: Vec<String> = (0..5)
        .map(|_| orch.submit_task(TaskRequest::new("serial", "sleep:20")).unwrap())
        .collect();

    let mut tasks = Vec::new();
    for id in &ids {
        tasks.push(orch.wait_task(id).await.unwrap());
    }

    for task in &tasks {
        assert_eq!(task.state, TaskState::Succeeded);
    }
    for pair in tasks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let prev_done = prev.completed_at.unwrap();
        let next_start = next.started_at.unwrap();
        assert!(
            next_start >= prev_done,
            "{} started before {} finished",
            next.id,
            prev.id
        );
    }
}

#[tokio::test]
async fn concurrency_limit_bounds_running_tasks() {
    let orch = scripted_orchestrator(vec![worker("pair", 2)]);
    let scheduler = orch.scheduler();

    let ids: Vec<String> = (0..4)
        .map(|_| scheduler.submit(TaskRequest::new("pair", "sleep:100")).unwrap())
        .collect();

    let running = scheduler
        .list_active()
        .iter()
        .filter(|t| t.state == TaskState::Running)
        .count();
    assert_eq!(running, 2);
    assert_eq!(scheduler.in_flight("pair"), 4);

    for id in &ids {
        assert_eq!(scheduler.wait(id).await.unwrap().state, TaskState::Succeeded);
    }
    assert_eq!(scheduler.in_flight("pair"), 0);
}

#[tokio::test]
async fn timeout_is_reported_once_and_frees_the_slot() {
    let orch = scripted_orchestrator(vec![worker("slow", 1)]);
    let scheduler = orch.scheduler();

    let id = scheduler
        .submit(TaskRequest::new("slow", "hang").with_timeout(Duration::from_millis(50)))
        .unwrap();
    let task = scheduler.wait(&id).await.unwrap();
    assert_eq!(task.state, TaskState::TimedOut);
    assert_eq!(task.timeout_ms, Some(50));
    assert!(task.error.unwrap().contains("50 ms"));

    // The slot is free again: a quick task runs to completion.
    let next = scheduler.submit(TaskRequest::new("slow", "ping")).unwrap();
    let done = tokio::time::timeout(Duration::from_secs(2), scheduler.wait(&next))
        .await
        .expect("slot was not released")
        .unwrap();
    assert_eq!(done.state, TaskState::Succeeded);

    let history = scheduler.history(100);
    assert_eq!(history.iter().filter(|t| t.id == id).count(), 1);
    assert_eq!(
        orch.registry().state("slow").unwrap().consecutive_failures,
        1
    );
}

#[tokio::test]
async fn results_and_failures_are_recorded() {
    let orch = scripted_orchestrator(vec![worker("echo", 1)]);

    let mut context = serde_json::Map::new();
    context.insert("lang".to_string(), serde_json::json!("rust"));
    let ok = orch
        .submit_task(TaskRequest::new("echo", "summarize").with_context(context))
        .unwrap();
    let task = orch.wait_task(&ok).await.unwrap();
    let result = task.result.unwrap();
    assert_eq!(result["instruction"], "summarize");
    assert_eq!(result["context"]["lang"], "rust");
    assert!(task.error.is_none());

    let bad = orch.submit_task(TaskRequest::new("echo", "fail:disk full")).unwrap();
    let task = orch.wait_task(&bad).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.result.is_none());
    assert!(task.error.unwrap().contains("disk full"));
}

#[tokio::test]
async fn cancelling_queued_task_leaves_the_rest_in_order() {
    let orch = scripted_orchestrator(vec![worker("solo", 1)]);
    let scheduler = orch.scheduler();

    let first = scheduler.submit(TaskRequest::new("solo", "sleep:50")).unwrap();
    let second = scheduler.submit(TaskRequest::new("solo", "sleep:1")).unwrap();
    let third = scheduler.submit(TaskRequest::new("solo", "sleep:1")).unwrap();

    let cancelled = scheduler.cancel(&second).unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);
    assert!(cancelled.started_at.is_none());

    assert_eq!(scheduler.wait(&first).await.unwrap().state, TaskState::Succeeded);
    assert_eq!(scheduler.wait(&third).await.unwrap().state, TaskState::Succeeded);

    // Terminal tasks cannot be cancelled again.
    assert!(matches!(
        scheduler.cancel(&second),
        Err(OrchestratorError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn unavailable_agents_refuse_work() {
    let orch = scripted_orchestrator(vec![worker("flaky", 1)]);
    let scheduler = orch.scheduler();

    assert!(matches!(
        scheduler.submit(TaskRequest::new("nobody", "x")),
        Err(OrchestratorError::UnknownAgent(_))
    ));

    orch.registry().record_probe("flaky", false, 3).unwrap();
    assert_eq!(orch.registry().state("flaky").unwrap().lifecycle, Lifecycle::Degraded);
    assert!(matches!(
        scheduler.submit(TaskRequest::new("flaky", "x").rejecting_degraded()),
        Err(OrchestratorError::AgentUnavailable { .. })
    ));
    let id = scheduler.submit(TaskRequest::new("flaky", "x")).unwrap();
    scheduler.wait(&id).await.unwrap();

    orch.registry().stop("flaky").unwrap();
    assert!(matches!(
        scheduler.submit(TaskRequest::new("flaky", "x")),
        Err(OrchestratorError::AgentUnavailable {
            lifecycle: Lifecycle::Stopped,
            ..
        })
    ));
}

#[tokio::test]
async fn deregistering_busy_agent_needs_force() {
    let orch = scripted_orchestrator(vec![worker("busy", 1)]);

    let running = orch.submit_task(TaskRequest::new("busy", "hang")).unwrap();
    let queued = orch.submit_task(TaskRequest::new("busy", "ping")).unwrap();

    assert!(matches!(
        orch.deregister("busy", false),
        Err(OrchestratorError::AgentBusy { in_flight: 2, .. })
    ));

    orch.deregister("busy", true).unwrap();
    assert!(!orch.registry().contains("busy"));
    assert_eq!(orch.wait_task(&running).await.unwrap().state, TaskState::Cancelled);
    assert_eq!(orch.wait_task(&queued).await.unwrap().state, TaskState::Cancelled);
    assert!(matches!(
        orch.submit_task(TaskRequest::new("busy", "ping")),
        Err(OrchestratorError::UnknownAgent(_))
    ));
}
