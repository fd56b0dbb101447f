//! Planning errors and cascading failures.

use std::sync::Arc;

use briareus::config::Config;
use briareus::core::{Capability, Decomposition, FailureReason, PlannedSubTask, SubTaskState};
use briareus::error::{PlanningError, RunError};
use briareus::orchestration::CriticRegistry;
use briareus::run::RunStatus;

use crate::fixtures::{fast_config, pool_of, RejectAll, ScriptedAgent, SupervisorHarness};

fn all_agents() -> Vec<Arc<ScriptedAgent>> {
    Capability::ALL
        .into_iter()
        .map(|cap| ScriptedAgent::new(cap).shared())
        .collect()
}

/// Test: Failure cascades down a chain
/// Given research -> code -> write plus an independent output-bearing summary
/// When research is abandoned
/// Then code and write fail without being dispatched and summary still succeeds
#[tokio::test]
async fn test_failure_cascades_without_dispatch() {
    let agents = all_agents();
    let harness = SupervisorHarness::new(pool_of(&agents))
        .with_critics(CriticRegistry::new().register(Capability::Research, Arc::new(RejectAll)));

    let plan = Decomposition::new("chain")
        .with_subtask(PlannedSubTask::new("research", Capability::Research, "find"))
        .with_subtask(PlannedSubTask::new("code", Capability::Code, "build").with_inputs(&["research"]))
        .with_subtask(
            PlannedSubTask::new("write", Capability::Write, "document")
                .with_inputs(&["code"])
                .output(),
        )
        .with_subtask(PlannedSubTask::new("summary", Capability::Write, "summarize").output());

    let report = harness.supervisor.execute("chain", plan).await.unwrap();

    assert_eq!(report.status, RunStatus::PartiallyCompleted);
    for id in ["code", "write"] {
        let failure = report.failure(&id.into()).unwrap();
        assert_eq!(
            failure.reason,
            FailureReason::Cascaded {
                upstream: "research".into()
            }
        );
        assert!(failure.attempts.is_empty());
        assert!(!failure.is_root_cause());
        assert_eq!(harness.count("attempt_started", id), 0);
        assert_eq!(harness.count("cascaded_failure", id), 1);
    }

    let roots: Vec<&str> = report.root_causes().iter().map(|f| f.subtask.as_str()).collect();
    assert_eq!(roots, vec!["research"]);
    assert_eq!(
        report.subtask(&"summary".into()).unwrap().state(),
        &SubTaskState::Accepted
    );
    assert_eq!(report.output.unwrap().body, "## summary\n\nsummary output\n");
}

/// Test: Cyclic plan
/// Given A -> B -> A
/// When the run executes
/// Then it fails with a cycle error and nothing is dispatched
#[tokio::test]
async fn test_cycle_rejected_before_dispatch() {
    let agents = all_agents();
    let harness = SupervisorHarness::new(pool_of(&agents));

    let plan = Decomposition::new("loop")
        .with_subtask(PlannedSubTask::new("a", Capability::Research, "a").with_inputs(&["b"]))
        .with_subtask(PlannedSubTask::new("b", Capability::Write, "b").with_inputs(&["a"]));

    let err = harness.supervisor.execute("loop", plan).await.unwrap_err();

    assert!(matches!(
        err,
        RunError::Planning(PlanningError::CyclicDependency { .. })
    ));
    assert!(agents.iter().all(|a| a.requests().is_empty()));
    assert!(harness.events().iter().all(|e| e.name() != "attempt_started"));
    assert!(harness.sink.last_snapshot().is_none());
}

/// Test: Dangling input reference
/// Given a sub-task that lists an undeclared input
/// When the run executes
/// Then it fails with a dangling reference naming both ids
#[tokio::test]
async fn test_dangling_reference_rejected() {
    let harness = SupervisorHarness::new(pool_of(&all_agents()));

    let plan = Decomposition::new("ghost").with_subtask(
        PlannedSubTask::new("write", Capability::Write, "write").with_inputs(&["ghost"]),
    );
    let err = harness.supervisor.execute("ghost", plan).await.unwrap_err();

    match err {
        RunError::Planning(PlanningError::DanglingReference { from, to }) => {
            assert_eq!(from.as_str(), "write");
            assert_eq!(to.as_str(), "ghost");
        }
        other => panic!("expected a dangling reference, got {:?}", other),
    }
}

/// Test: Plan length limit
/// Given max_plan_steps = 6
/// When the planner returns seven sub-tasks
/// Then the plan is rejected as too long
#[tokio::test]
async fn test_too_many_steps_rejected() {
    let config = Config {
        max_plan_steps: 6,
        ..fast_config()
    };
    let harness = SupervisorHarness::with_config(&config, pool_of(&all_agents()));

    let plan = (0..7).fold(Decomposition::new("long"), |plan, i| {
        plan.with_subtask(PlannedSubTask::new(
            &format!("step-{}", i),
            Capability::Research,
            "look",
        ))
    });
    let err = harness.supervisor.execute("long", plan).await.unwrap_err();

    assert!(matches!(
        err,
        RunError::Planning(PlanningError::TooManySteps { count: 7, max: 6 })
    ));
}

/// Test: Only root causes are reported as such
/// Given a diamond where both branches depend on a root that fails
/// When the run executes
/// Then the join node is cascaded once, from the root
#[tokio::test]
async fn test_diamond_cascades_once() {
    let agents = all_agents();
    let harness = SupervisorHarness::new(pool_of(&agents))
        .with_critics(CriticRegistry::new().register(Capability::Research, Arc::new(RejectAll)));

    let plan = Decomposition::new("diamond")
        .with_subtask(PlannedSubTask::new("root", Capability::Research, "find"))
        .with_subtask(PlannedSubTask::new("left", Capability::Code, "l").with_inputs(&["root"]))
        .with_subtask(PlannedSubTask::new("right", Capability::Write, "r").with_inputs(&["root"]))
        .with_subtask(
            PlannedSubTask::new("join", Capability::Write, "j").with_inputs(&["left", "right"]),
        );

    let report = harness.supervisor.execute("diamond", plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(harness.count("cascaded_failure", "join"), 1);
    let failed: Vec<&str> = report.failures.iter().map(|f| f.subtask.as_str()).collect();
    assert_eq!(failed, vec!["root", "left", "right", "join"]);
    assert_eq!(report.root_causes().len(), 1);
}
