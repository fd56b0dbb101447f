//! Synthesis is independent of completion order.

use briareus::core::{Capability, Decomposition, GraphSnapshot, PlannedSubTask, TaskGraph};
use briareus::orchestration::{RunReport, Synthesizer};
use briareus::run::RunStatus;

use crate::fixtures::{pool_of, reply_after, ScriptedAgent, SupervisorHarness};

/// Two independent output-bearing roots and an output-bearing join.
fn three_outputs() -> Decomposition {
    Decomposition::new("parser release")
        .with_subtask(PlannedSubTask::new("notes", Capability::Research, "survey").output())
        .with_subtask(PlannedSubTask::new("patch", Capability::Code, "implement").output())
        .with_subtask(
            PlannedSubTask::new("post", Capability::Write, "announce")
                .with_inputs(&["notes", "patch"])
                .output(),
        )
}

async fn run_with_delays(research_ms: u64, code_ms: u64) -> RunReport {
    let researcher = ScriptedAgent::new(Capability::Research)
        .script("notes", vec![reply_after(research_ms, "PEG vs LR")])
        .shared();
    let coder = ScriptedAgent::new(Capability::Code)
        .script("patch", vec![reply_after(code_ms, "+fn parse() {}")])
        .shared();
    let writer = ScriptedAgent::new(Capability::Write)
        .script("post", vec![reply_after(0, "We shipped a parser.\n\n")])
        .shared();
    let harness = SupervisorHarness::new(pool_of(&[researcher, coder, writer]));
    harness
        .supervisor
        .execute("parser release", three_outputs())
        .await
        .unwrap()
}

/// Test: Completion order does not change the output
/// Given two independent roots with swapped completion timings
/// When both runs complete
/// Then the bodies and sections are identical
#[tokio::test]
async fn test_output_independent_of_completion_order() {
    let research_first = run_with_delays(0, 40).await;
    let code_first = run_with_delays(40, 0).await;

    assert_eq!(research_first.status, RunStatus::Completed);
    assert_eq!(code_first.status, RunStatus::Completed);

    let a = research_first.output.unwrap();
    let b = code_first.output.unwrap();
    assert_eq!(a.body, b.body);
    assert_eq!(a.sections, b.sections);
    assert_eq!(
        a.body,
        "## notes (supporting)\n\nPEG vs LR\n\n\
         ## patch\n\n```diff\n+fn parse() {}\n```\n\n\
         ## post\n\nWe shipped a parser.\n"
    );
}

/// Test: Re-synthesis from a stored graph
/// Given the graph snapshot of a completed run, serialized and parsed back
/// When the synthesizer runs again on the restored graph
/// Then it produces exactly the stored output
#[tokio::test]
async fn test_resynthesis_from_snapshot_is_identical() {
    let report = run_with_delays(5, 5).await;
    let output = report.output.clone().unwrap();

    let json = serde_json::to_string(&report.graph).unwrap();
    let snapshot: GraphSnapshot = serde_json::from_str(&json).unwrap();
    let graph = TaskGraph::restore(snapshot).unwrap();

    let again = Synthesizer::new().synthesize(report.run_id, &graph).unwrap();
    assert_eq!(again, output);
}
