//! Retry, escalation and feedback propagation.

use std::sync::Arc;

use briareus::config::EscalationRule;
use briareus::core::{
    AcceptanceCriteria, AttemptOutcome, Capability, Decomposition, FailureReason, PlannedSubTask,
};
use briareus::orchestration::CriticRegistry;
use briareus::run::RunStatus;

use crate::fixtures::{
    fast_config, pool_of, reply, ContainsCritic, RejectAll, ScriptedAgent, Step, SupervisorHarness,
};

fn single(planned: PlannedSubTask) -> Decomposition {
    Decomposition::new("single step").with_subtask(planned)
}

/// Test: Escalation after retries on the planned capability
/// Given a code sub-task with a research fallback and a critic that rejects everything
/// When the run executes with max_retries = 2
/// Then two attempts go to code, the third to research, and the sub-task fails
#[tokio::test]
async fn test_escalates_once_then_abandons() {
    let coder = ScriptedAgent::new(Capability::Code).shared();
    let researcher = ScriptedAgent::new(Capability::Research).shared();
    let harness = SupervisorHarness::new(pool_of(&[coder.clone(), researcher.clone()]))
        .with_critics(CriticRegistry::new().register(Capability::Code, Arc::new(RejectAll)));

    let plan = single(
        PlannedSubTask::new("fix", Capability::Code, "patch the bug").with_fallback(Capability::Research),
    );
    let report = harness.supervisor.execute("fix it", plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    let fix = report.failure(&"fix".into()).unwrap();
    assert_eq!(fix.reason, FailureReason::RetriesExhausted { attempts: 3 });
    let routed: Vec<Capability> = fix.attempts.iter().map(|a| a.capability).collect();
    assert_eq!(
        routed,
        vec![Capability::Code, Capability::Code, Capability::Research]
    );
    assert_eq!(harness.count("escalated", "fix"), 1);

    assert_eq!(coder.requests().len(), 2);
    let escalated = researcher.requests_for("fix");
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].attempt, 3);
    assert_eq!(escalated[0].capability, Capability::Research);
    assert_eq!(escalated[0].feedback.as_deref(), Some("not good enough"));
}

/// Test: Escalation rules from configuration
/// Given an escalation rule code -> write and a critic that wants "patched"
/// When only the writer produces an acceptable artifact
/// Then the escalated attempt is accepted and judged by the code critic
#[tokio::test]
async fn test_config_escalation_rule_rescues_subtask() {
    let coder = ScriptedAgent::new(Capability::Code).shared();
    let writer = ScriptedAgent::new(Capability::Write)
        .script("fix", vec![reply("patched by writer")])
        .shared();
    let mut config = fast_config();
    config.escalation = vec![EscalationRule {
        from: Capability::Code,
        to: Capability::Write,
    }];
    let harness = SupervisorHarness::with_config(&config, pool_of(&[coder, writer.clone()]))
        .with_critics(
            CriticRegistry::new().register(Capability::Code, Arc::new(ContainsCritic("patched"))),
        );

    let report = harness
        .supervisor
        .execute("fix it", single(PlannedSubTask::new("fix", Capability::Code, "patch")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let fix = report.subtask(&"fix".into()).unwrap();
    assert_eq!(fix.attempts().len(), 3);
    assert_eq!(fix.routed(), Capability::Write);
    assert_eq!(fix.capability(), Capability::Code);
    assert_eq!(writer.requests_for("fix").len(), 1);

    // Sections are grouped by planned capability.
    let output = report.output.unwrap();
    assert_eq!(output.body, "## fix\n\n```diff\npatched by writer\n```\n");
    assert_eq!(output.sections[0].attempt, 3);
}

/// Test: Critic feedback reaches the next attempt
/// Given a write sub-task that must mention "citation"
/// When the first draft omits it
/// Then the second request carries the rendered feedback and is accepted
#[tokio::test]
async fn test_feedback_passed_to_retry() {
    let writer = ScriptedAgent::new(Capability::Write)
        .script("essay", vec![reply("draft"), reply("draft with a citation")])
        .shared();
    let harness = SupervisorHarness::new(pool_of(&[writer.clone()]));

    let plan = single(
        PlannedSubTask::new("essay", Capability::Write, "write an essay").with_acceptance(
            AcceptanceCriteria {
                must_include: vec!["citation".to_string()],
                ..AcceptanceCriteria::described("cites a source")
            },
        ),
    );
    let report = harness.supervisor.execute("essay", plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let requests = writer.requests_for("essay");
    assert_eq!(requests.len(), 2);
    assert!(requests[0].feedback.is_none());
    let feedback = requests[1].feedback.clone().unwrap();
    assert_eq!(
        feedback,
        "does not satisfy: cites a source\n- missing required term \"citation\""
    );

    let essay = report.subtask(&"essay".into()).unwrap();
    assert_eq!(essay.attempts()[1].feedback_in.as_deref(), Some(feedback.as_str()));
    assert_eq!(harness.count("verdict_recorded", "essay"), 2);
}

/// Test: An agent error counts as a rejected attempt
/// Given a research agent that fails once and then succeeds
/// When the run executes
/// Then the error becomes feedback and attempt 2 is accepted
#[tokio::test]
async fn test_agent_error_is_retried() {
    let researcher = ScriptedAgent::new(Capability::Research)
        .script(
            "facts",
            vec![Step::Error("rate limited".to_string()), reply("facts")],
        )
        .shared();
    let harness = SupervisorHarness::new(pool_of(&[researcher.clone()]));

    let report = harness
        .supervisor
        .execute("facts", single(PlannedSubTask::new("facts", Capability::Research, "look")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let facts = report.subtask(&"facts".into()).unwrap();
    assert!(matches!(facts.attempts()[0].outcome, AttemptOutcome::Errored { .. }));
    assert!(researcher.requests_for("facts")[1]
        .feedback
        .as_deref()
        .is_some_and(|f| f.contains("rate limited")));
    assert_eq!(report.output.unwrap().sections[0].attempt, 2);
}

/// Test: Missing capability escalates to one that is registered
/// Given no code agent and a code sub-task with a research fallback
/// When the run executes
/// Then the code attempts fail immediately and the research attempt is accepted
#[tokio::test]
async fn test_unknown_capability_escalates() {
    let researcher = ScriptedAgent::new(Capability::Research).shared();
    let harness = SupervisorHarness::new(pool_of(&[researcher.clone()]));

    let plan = single(
        PlannedSubTask::new("port", Capability::Code, "port the module")
            .with_fallback(Capability::Research),
    );
    let report = harness.supervisor.execute("port", plan).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let port = report.subtask(&"port".into()).unwrap();
    assert_eq!(port.attempts().len(), 3);
    for attempt in &port.attempts()[..2] {
        assert!(matches!(
            &attempt.outcome,
            AttemptOutcome::Errored { error } if error.contains("No agent is registered for capability code")
        ));
    }
    assert_eq!(researcher.requests_for("port").len(), 1);
}

/// Test: Zero retries
/// Given max_retries = 0
/// When the first attempt is rejected
/// Then the sub-task fails after exactly one attempt
#[tokio::test]
async fn test_zero_retries_fails_after_one_attempt() {
    let coder = ScriptedAgent::new(Capability::Code).shared();
    let mut config = fast_config();
    config.max_retries = 0;
    let harness = SupervisorHarness::with_config(&config, pool_of(&[coder.clone()]))
        .with_critics(CriticRegistry::with_default(Arc::new(RejectAll)));

    let report = harness
        .supervisor
        .execute("patch", single(PlannedSubTask::new("patch", Capability::Code, "patch")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        report.failure(&"patch".into()).unwrap().reason,
        FailureReason::RetriesExhausted { attempts: 1 }
    );
    assert_eq!(coder.requests().len(), 1);
}
