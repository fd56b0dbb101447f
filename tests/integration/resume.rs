//! Continuing runs from snapshots.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use briareus::core::{AttemptOutcome, Capability, SubTaskState};
use briareus::error::RunError;
use briareus::orchestration::CriticRegistry;
use briareus::run::RunStatus;
use briareus::state::{RunSnapshot, SnapshotStore};

use crate::fixtures::{
    pool_of, reply, research_then_write, ContainsCritic, ScriptedAgent, Step, SupervisorHarness,
};

/// Most recent snapshot in which `subtask` was in state `label`.
fn snapshot_with(harness: &SupervisorHarness, subtask: &str, label: &str) -> RunSnapshot {
    harness
        .sink
        .snapshots()
        .into_iter()
        .rev()
        .find(|s| {
            s.graph
                .nodes
                .iter()
                .any(|t| t.id().as_str() == subtask && t.state().label() == label)
        })
        .expect("no snapshot with the requested state")
}

/// Test: Resume after the process stopped mid-attempt
/// Given a snapshot taken while write was dispatched
/// When the run is resumed with fresh agents
/// Then the open attempt is closed as interrupted, write is dispatched again
/// and research is not re-run
#[tokio::test]
async fn test_resume_interrupted_attempt() {
    let researcher = ScriptedAgent::new(Capability::Research).shared();
    let stuck_writer = ScriptedAgent::new(Capability::Write)
        .otherwise(Step::Hang)
        .shared();
    let first = SupervisorHarness::new(pool_of(&[researcher.clone(), stuck_writer]));

    let sink = first.sink.clone();
    let cancel = first.supervisor.cancel_token();
    tokio::spawn(async move {
        loop {
            let started = sink
                .events()
                .iter()
                .any(|e| e.name() == "attempt_started" && e.subtask().is_some_and(|s| s.as_str() == "write"));
            if started {
                cancel.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    let aborted = first
        .supervisor
        .execute("explain ownership", research_then_write())
        .await
        .unwrap();
    assert_eq!(aborted.status, RunStatus::Aborted);

    let snapshot = snapshot_with(&first, "write", "dispatched");
    assert_eq!(snapshot.run.status(), RunStatus::Running);

    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(dir.path());
    store.save(&snapshot).unwrap();
    assert_eq!(store.list().unwrap(), vec![snapshot.run_id()]);
    let loaded = store.load(&snapshot.run_id()).unwrap();

    let fresh_researcher = ScriptedAgent::new(Capability::Research).shared();
    let writer = ScriptedAgent::new(Capability::Write)
        .script("write", vec![reply("Ownership, finally explained.")])
        .shared();
    let second = SupervisorHarness::new(pool_of(&[fresh_researcher.clone(), writer.clone()]));

    let report = second.supervisor.resume(loaded).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.run_id, snapshot.run_id());
    assert!(fresh_researcher.requests().is_empty());
    assert_eq!(researcher.requests().len(), 1);

    let write = report.subtask(&"write".into()).unwrap();
    let outcomes: Vec<&AttemptOutcome> = write.attempts().iter().map(|a| &a.outcome).collect();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0], &AttemptOutcome::Interrupted);
    assert!(matches!(outcomes[1], AttemptOutcome::Produced { .. }));

    let requests = writer.requests_for("write");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].attempt, 2);
    assert_eq!(requests[0].inputs[0].provenance.attempt, 1);
    assert_eq!(second.count("attempt_finished", "write"), 2);
}

/// Test: Resume of a rejected sub-task
/// Given a snapshot taken while write was waiting out its retry backoff
/// When the run is resumed
/// Then write retries at once with the stored feedback
#[tokio::test]
async fn test_resume_rejected_retries_with_feedback() {
    let researcher = ScriptedAgent::new(Capability::Research).shared();
    let drafter = ScriptedAgent::new(Capability::Write)
        .otherwise(Step::Reply("draft".to_string()))
        .shared();
    let critics = CriticRegistry::new().register(Capability::Write, Arc::new(ContainsCritic("final")));
    let first = SupervisorHarness::new(pool_of(&[researcher, drafter]))
        .with_critics(critics.clone());

    let partial = first
        .supervisor
        .execute("explain ownership", research_then_write())
        .await
        .unwrap();
    assert_eq!(partial.status, RunStatus::PartiallyCompleted);

    let snapshot = snapshot_with(&first, "write", "rejected");
    let attempts_before = snapshot
        .graph
        .nodes
        .iter()
        .find(|t| t.id().as_str() == "write")
        .map(|t| t.attempts().len())
        .unwrap();

    let writer = ScriptedAgent::new(Capability::Write)
        .script("write", vec![reply("the final draft")])
        .shared();
    let second = SupervisorHarness::new(pool_of(&[ScriptedAgent::new(Capability::Research).shared(), writer.clone()]))
        .with_critics(critics);

    let report = second.supervisor.resume(snapshot).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let request = &writer.requests_for("write")[0];
    assert_eq!(request.attempt as usize, attempts_before + 1);
    assert_eq!(request.feedback.as_deref(), Some("expected \"final\""));
}

/// Test: Resuming an inconsistent snapshot stalls
/// Given a snapshot edited so write is pending while research has failed
/// When the run is resumed
/// Then nothing can be dispatched and the run reports a stall
#[tokio::test]
async fn test_resume_inconsistent_snapshot_stalls() {
    let researcher = ScriptedAgent::new(Capability::Research)
        .otherwise(Step::Error("down".to_string()))
        .shared();
    let writer = ScriptedAgent::new(Capability::Write).shared();
    let first = SupervisorHarness::new(pool_of(&[researcher.clone(), writer.clone()]));

    let aborted = first
        .supervisor
        .execute("explain ownership", research_then_write())
        .await
        .unwrap();
    assert_eq!(aborted.status, RunStatus::Aborted);

    let mut value = serde_json::to_value(first.sink.last_snapshot().unwrap()).unwrap();
    value["run"]["status"] = json!("running");
    if let Some(nodes) = value["graph"]["nodes"].as_array_mut() {
        for node in nodes {
            if node["id"] == json!("write") {
                node["state"] = json!({ "state": "pending" });
            }
        }
    }
    let edited: RunSnapshot = serde_json::from_value(value).unwrap();

    let second = SupervisorHarness::new(pool_of(&[researcher, writer.clone()]));
    match second.supervisor.resume(edited).await {
        Err(RunError::Stalled(report)) => {
            assert_eq!(report.status, RunStatus::Aborted);
            let unfinished: Vec<&str> = report.unfinished().iter().map(|t| t.id().as_str()).collect();
            assert_eq!(unfinished, vec!["write"]);
            assert_eq!(
                report.subtask(&"write".into()).unwrap().state(),
                &SubTaskState::Pending
            );
        }
        other => panic!("expected a stall, got {:?}", other.map(|r| r.status)),
    }
    assert!(writer.requests().is_empty());
}
