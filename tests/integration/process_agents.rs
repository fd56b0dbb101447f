//! Command-backed agents and planners.

use std::sync::Arc;

use tempfile::TempDir;

use briareus::core::{AttemptOutcome, Capability};
use briareus::error::RunError;
use briareus::orchestration::{AgentHandle, AgentPool, CommandAgent, FilePlanner, StaticPlanner};
use briareus::run::RunStatus;

use crate::fixtures::{research_then_write, SupervisorHarness};

fn command(capability: Capability, line: &str) -> Arc<dyn AgentHandle> {
    Arc::new(CommandAgent::new(capability, line).unwrap())
}

/// Test: Process agents end to end
/// Given an `echo` researcher and a `cat` writer
/// When research feeds write
/// Then the writer receives the research artifact in its JSON request
#[tokio::test]
async fn test_command_agents_complete_run() {
    let pool = AgentPool::new(2)
        .with_agent(command(Capability::Research, "echo borrow checker notes"))
        .with_agent(command(Capability::Write, "cat"));
    let harness = SupervisorHarness::new(pool);

    let report = harness
        .supervisor
        .execute("explain ownership", research_then_write())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let output = report.output.unwrap();
    assert_eq!(output.sections[0].content, "borrow checker notes");

    // `cat` echoes the attempt request back as the artifact.
    let request: serde_json::Value = serde_json::from_str(&output.sections[1].content).unwrap();
    assert_eq!(request["subtask"], "write");
    assert_eq!(request["brief"], "write the explainer");
    assert_eq!(request["inputs"][0]["content"], "borrow checker notes");
    assert_eq!(request["inputs"][0]["provenance"]["subtask"], "research");
}

/// Test: Missing agent binary
/// Given a research agent whose program is not installed
/// When the run executes
/// Then every attempt errors as unavailable and write cascades
#[tokio::test]
async fn test_missing_binary_fails_subtask() {
    let pool = AgentPool::new(2)
        .with_agent(command(Capability::Research, "briareus-no-such-agent --json"))
        .with_agent(command(Capability::Write, "cat"));
    let harness = SupervisorHarness::new(pool);

    let report = harness
        .supervisor
        .execute("explain ownership", research_then_write())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    let research = report.failure(&"research".into()).unwrap();
    assert_eq!(research.attempts.len(), 3);
    for attempt in &research.attempts {
        assert!(matches!(
            &attempt.outcome,
            AttemptOutcome::Errored { error } if error == "No research agent is available"
        ));
    }
    assert!(!report.failure(&"write".into()).unwrap().is_root_cause());
}

/// Test: Plan read from a TOML file
/// Given a plan file without a goal
/// When the supervisor runs a request through the file planner
/// Then the plan executes and the report carries the request
#[tokio::test]
async fn test_file_planner_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plan.toml");
    std::fs::write(
        &path,
        r#"
[[subtasks]]
id = "notes"
capability = "research"
brief = "collect sources"

[[subtasks]]
id = "post"
capability = "write"
brief = "write the post"
inputs = ["notes"]

[subtasks.acceptance]
description = "mentions the request"
must_include = ["post"]
"#,
    )
    .unwrap();

    let pool = AgentPool::new(2)
        .with_agent(command(Capability::Research, "echo sources"))
        .with_agent(command(Capability::Write, "cat"));
    let harness = SupervisorHarness::new(pool);

    let report = harness
        .supervisor
        .run("blog post on lifetimes", &FilePlanner::new(&path))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.request, "blog post on lifetimes");
    let sections = report.output.unwrap().sections;
    let ids: Vec<&str> = sections.iter().map(|s| s.subtask.as_str()).collect();
    assert_eq!(ids, vec!["notes", "post"]);
    assert_eq!(sections[0].content, "sources");
}

/// Test: Planner failure
/// Given a file planner pointing at a missing file
/// When the supervisor runs a request
/// Then the planner error is surfaced and nothing is dispatched
#[tokio::test]
async fn test_planner_failure_surfaces() {
    let harness = SupervisorHarness::new(
        AgentPool::new(1).with_agent(command(Capability::Research, "echo unused")),
    );

    let result = harness
        .supervisor
        .run("anything", &FilePlanner::new("/nonexistent/briareus/plan.toml"))
        .await;

    assert!(matches!(result, Err(RunError::Planner(_))));
    assert!(harness.events().is_empty());
}

/// Test: Static planner
/// Given a fixed decomposition
/// When two requests run through the same supervisor
/// Then each gets its own run id and the same output
#[tokio::test]
async fn test_static_planner_runs_are_independent() {
    let pool = AgentPool::new(2)
        .with_agent(command(Capability::Research, "echo facts"))
        .with_agent(command(Capability::Write, "echo prose"));
    let harness = SupervisorHarness::new(pool);
    let planner = StaticPlanner::new(research_then_write());

    let first = harness.supervisor.run("first", &planner).await.unwrap();
    let second = harness.supervisor.run("second", &planner).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(
        first.output.as_ref().map(|o| &o.body),
        second.output.as_ref().map(|o| &o.body)
    );
    let finished = harness
        .events()
        .iter()
        .filter(|e| e.name() == "run_finished")
        .count();
    assert_eq!(finished, 2);
}
