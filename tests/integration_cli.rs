//! End-to-end tests for the `amesh` binary.
//!
//! Each test gets its own data directory; agents use the built-in shell
//! executor so no handler code is needed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn amesh_binary() -> PathBuf {
    let mut path = std::env::current_exe().expect("could not get current exe path");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("amesh");
    assert!(
        path.exists(),
        "amesh binary not found at {:?}. Run `cargo build` first.",
        path
    );
    path
}

fn amesh_cmd(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(amesh_binary())
        .arg("--dir")
        .arg(dir)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run amesh {:?}: {}", args, e))
}

fn amesh_ok(dir: &Path, args: &[&str]) -> String {
    let output = amesh_cmd(dir, args);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    assert!(
        output.status.success(),
        "amesh {:?} failed.\nstdout: {}\nstderr: {}",
        args,
        stdout,
        stderr
    );
    stdout
}

fn amesh_err(dir: &Path, args: &[&str]) -> String {
    let output = amesh_cmd(dir, args);
    assert!(!output.status.success(), "amesh {:?} unexpectedly succeeded", args);
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Initialise a data directory and register a shell agent named `runner`.
fn setup() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join(".agentmesh");
    amesh_ok(&dir, &["init"]);

    let doc = tmp.path().join("runner.md");
    fs::write(
        &doc,
        "---\nname: runner\nexecutor: shell\ncapabilities:\n  - shell\nresource_limits:\n  concurrency: 2\n---\n\nRuns shell commands.\n",
    )
    .unwrap();
    amesh_ok(&dir, &["register", doc.to_str().unwrap()]);
    (tmp, dir)
}

#[test]
fn commands_require_init() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("missing");
    let stderr = amesh_err(&dir, &["agents"]);
    assert!(stderr.contains("amesh init"), "stderr: {}", stderr);
}

#[test]
fn init_then_register_lists_agent() {
    let (_tmp, dir) = setup();
    assert!(dir.join("agents/runner.md").exists());
    assert!(dir.join("config.toml").exists());

    let table = amesh_ok(&dir, &["agents"]);
    assert!(table.contains("runner"));
    assert!(table.contains("1 agent(s)"));

    let json = amesh_ok(&dir, &["agents", "--json"]);
    let agents: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(agents[0]["name"], "runner");
    assert_eq!(agents[0]["executor"], "shell");
    assert_eq!(agents[0]["lifecycle"], "registered");

    let stderr = amesh_err(&dir, &["init"]);
    assert!(stderr.contains("already initialized"));
}

#[test]
fn registration_order_survives_between_commands() {
    let (tmp, dir) = setup();
    for name in ["zeta", "alpha"] {
        let doc = tmp.path().join(format!("{}.md", name));
        fs::write(
            &doc,
            format!("---\nname: {}\nexecutor: shell\ncapabilities:\n  - shell\n---\n", name),
        )
        .unwrap();
        amesh_ok(&dir, &["register", doc.to_str().unwrap()]);
    }

    let json = amesh_ok(&dir, &["agents", "--json"]);
    let agents: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
    let names: Vec<&str> = agents.iter().map(|a| a["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["runner", "zeta", "alpha"]);
}

#[test]
fn duplicate_register_is_refused() {
    let (tmp, dir) = setup();
    let stderr = amesh_err(&dir, &["register", tmp.path().join("runner.md").to_str().unwrap()]);
    assert!(stderr.contains("already registered"), "stderr: {}", stderr);
    amesh_ok(&dir, &["register", "--update", tmp.path().join("runner.md").to_str().unwrap()]);
}

#[test]
fn submit_runs_shell_task() {
    let (_tmp, dir) = setup();

    let out = amesh_ok(&dir, &["submit", "runner", "echo hello", "--wait"]);
    assert!(out.contains("succeeded"), "stdout: {}", out);
    assert!(out.contains("hello"));

    let json = amesh_ok(
        &dir,
        &["--json", "submit", "runner", "echo \"$TASK_CONTEXT\"", "--context", r#"{"k": 7}"#, "--wait"],
    );
    let task: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(task["state"], "succeeded");
    assert_eq!(task["result"]["k"], 7);

    let stderr = amesh_err(&dir, &["submit", "runner", "exit 3", "--wait"]);
    assert!(stderr.contains("failed"), "stderr: {}", stderr);

    let stderr = amesh_err(&dir, &["submit", "ghost", "echo hi"]);
    assert!(stderr.contains("Unknown agent 'ghost'"), "stderr: {}", stderr);
}

#[test]
fn submit_times_out() {
    let (_tmp, dir) = setup();
    let stderr = amesh_err(&dir, &["submit", "runner", "sleep 5", "--timeout", "1", "--wait"]);
    assert!(stderr.contains("timed-out"), "stderr: {}", stderr);
}

#[test]
fn workflow_dry_run_and_execution() {
    let (tmp, dir) = setup();
    let wf = tmp.path().join("build.yaml");
    fs::write(
        &wf,
        "steps:\n  - id: fetch\n    agent: runner\n    instruction: echo fetched\n  - id: build\n    capability: shell\n    instruction: echo built\n    depends_on: [fetch]\n  - id: lint\n    agent: runner\n    instruction: echo linted\n    depends_on: [fetch]\n",
    )
    .unwrap();

    let plan = amesh_ok(&dir, &["workflow", wf.to_str().unwrap(), "--dry-run"]);
    assert!(plan.contains("Layer 1: fetch"));
    assert!(plan.contains("Layer 2: build, lint"));

    let out = amesh_ok(&dir, &["--json", "workflow", wf.to_str().unwrap()]);
    let result: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(result["status"], "completed");
    assert_eq!(result["steps"]["build"]["output"], "built");
    assert_eq!(result["steps"]["build"]["agent"], "runner");

    let cyclic = tmp.path().join("cyclic.yaml");
    fs::write(
        &cyclic,
        "steps:\n  - id: a\n    agent: runner\n    depends_on: [b]\n  - id: b\n    agent: runner\n    depends_on: [a]\n",
    )
    .unwrap();
    let stderr = amesh_err(&dir, &["workflow", cyclic.to_str().unwrap()]);
    assert!(stderr.contains("cycle"), "stderr: {}", stderr);
}

#[test]
fn export_import_round_trip() {
    let (tmp, dir) = setup();
    let snapshot = tmp.path().join("snapshot.json");
    amesh_ok(&dir, &["export", snapshot.to_str().unwrap()]);

    let printed = amesh_ok(&dir, &["export"]);
    let from_stdout: serde_json::Value = serde_json::from_str(&printed).unwrap();
    assert_eq!(from_stdout["agents"][0]["name"], "runner");

    let other = tmp.path().join("other");
    amesh_ok(&other, &["init"]);
    let out = amesh_ok(&other, &["import", snapshot.to_str().unwrap()]);
    assert!(out.contains("Imported 1 agent(s)"));
    assert!(amesh_ok(&other, &["show", "runner"]).contains("Executor: shell"));

    let stderr = amesh_err(&other, &["import", snapshot.to_str().unwrap()]);
    assert!(stderr.contains("already registered"), "stderr: {}", stderr);
}

#[test]
fn lifecycle_commands_persist_state() {
    let (_tmp, dir) = setup();

    amesh_ok(&dir, &["health", "--once"]);
    let shown = amesh_ok(&dir, &["show", "runner"]);
    assert!(shown.contains("State: running"), "stdout: {}", shown);

    assert!(amesh_ok(&dir, &["stop", "runner"]).contains("runner: stopped"));
    let stderr = amesh_err(&dir, &["submit", "runner", "echo hi"]);
    assert!(stderr.contains("unavailable (stopped)"), "stderr: {}", stderr);

    assert!(amesh_ok(&dir, &["start", "runner"]).contains("runner: starting"));
    let stderr = amesh_err(&dir, &["reset", "runner"]);
    assert!(stderr.contains("only failed agents"), "stderr: {}", stderr);

    amesh_ok(&dir, &["deregister", "runner"]);
    assert!(!dir.join("agents/runner.md").exists());
    assert!(amesh_ok(&dir, &["agents"]).contains("No agents registered."));
}
