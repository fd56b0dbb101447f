//! Sub-task data model for the task graph.
//!
//! Sub-tasks are the atomic units of delegated work. Each one carries its
//! planner-assigned identity, the capability it needs, acceptance criteria,
//! and an append-only history of attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::plan::PlannedSubTask;

/// Identifier of a sub-task, unique within a run.
///
/// Assigned by the planner so that dependency declarations can refer to
/// sub-tasks by name before the graph exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubTaskId(pub String);

impl SubTaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubTaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubTaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The class of agent able to perform a sub-task.
///
/// A closed set: the pool maps each variant to its handles by exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Research,
    Code,
    Write,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Research, Capability::Code, Capability::Write];

    /// Artifact kind an agent of this capability produces unless it says otherwise.
    pub fn default_kind(&self) -> ArtifactKind {
        match self {
            Capability::Research => ArtifactKind::ResearchNotes,
            Capability::Code => ArtifactKind::CodeDiff,
            Capability::Write => ArtifactKind::ProseSection,
        }
    }

    /// Name of the specialist agent serving this capability.
    pub fn agent_name(&self) -> &'static str {
        match self {
            Capability::Research => "researcher",
            Capability::Code => "coder",
            Capability::Write => "writer",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Research => write!(f, "research"),
            Capability::Code => write!(f, "code"),
            Capability::Write => write!(f, "write"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "research" | "researcher" => Ok(Capability::Research),
            "code" | "coder" => Ok(Capability::Code),
            "write" | "writer" => Ok(Capability::Write),
            other => Err(format!("unknown capability: {}", other)),
        }
    }
}

/// Content type tag of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ResearchNotes,
    CodeDiff,
    ProseSection,
    Other(String),
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::ResearchNotes => write!(f, "research-notes"),
            ArtifactKind::CodeDiff => write!(f, "code-diff"),
            ArtifactKind::ProseSection => write!(f, "prose-section"),
            ArtifactKind::Other(tag) => write!(f, "{}", tag),
        }
    }
}

/// Which sub-task and attempt produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub subtask: SubTaskId,
    pub attempt: u32,
}

/// Output of a successful attempt. Immutable once produced and shared by
/// `Arc` between the critic, downstream inputs and the synthesizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    pub kind: ArtifactKind,
    pub provenance: Provenance,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(content: impl Into<String>, kind: ArtifactKind, provenance: Provenance) -> Self {
        Self {
            content: content.into(),
            kind,
            provenance,
            produced_at: Utc::now(),
        }
    }
}

/// Predicate description consumed by the critic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    #[serde(default)]
    pub description: String,
    /// Terms that must appear in the artifact (case-insensitive).
    #[serde(default)]
    pub must_include: Vec<String>,
    /// Regular expressions the artifact must match.
    #[serde(default)]
    pub must_match: Vec<String>,
    #[serde(default)]
    pub min_chars: Option<usize>,
    #[serde(default)]
    pub expected_kind: Option<ArtifactKind>,
}

impl AcceptanceCriteria {
    pub fn described(description: &str) -> Self {
        Self {
            description: description.to_string(),
            ..Default::default()
        }
    }
}

/// Structured explanation attached to a rejection. Rendered into the next
/// attempt's input so the agent sees why it was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Feedback {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            issues: Vec::new(),
        }
    }

    pub fn with_issues(summary: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            summary: summary.into(),
            issues,
        }
    }

    pub fn timeout() -> Self {
        Self::new("timeout")
    }

    pub fn render(&self) -> String {
        if self.issues.is_empty() {
            return self.summary.clone();
        }
        let mut out = self.summary.clone();
        for issue in &self.issues {
            out.push_str("\n- ");
            out.push_str(issue);
        }
        out
    }
}

impl std::fmt::Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Critic judgement on one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum Verdict {
    Accept,
    Reject { feedback: Feedback },
}

impl Verdict {
    pub fn reject(summary: impl Into<String>) -> Self {
        Verdict::Reject {
            feedback: Feedback::new(summary),
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    pub fn feedback(&self) -> Option<&Feedback> {
        match self {
            Verdict::Accept => None,
            Verdict::Reject { feedback } => Some(feedback),
        }
    }
}

/// What an attempt returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    /// Dispatched and not yet observed by the supervisor.
    InFlight,
    Produced { artifact: Arc<Artifact> },
    Errored { error: String },
    TimedOut,
    /// Cancelled because the run was aborted.
    Cancelled,
    /// The process owning the run stopped while this attempt was in flight.
    Interrupted,
}

impl AttemptOutcome {
    pub fn artifact(&self) -> Option<&Arc<Artifact>> {
        match self {
            AttemptOutcome::Produced { artifact } => Some(artifact),
            _ => None,
        }
    }
}

/// One dispatch of a sub-task to an agent handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, strictly increasing within the sub-task.
    pub seq: u32,
    pub capability: Capability,
    /// Rendered feedback from the previous rejection, if any.
    pub feedback_in: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub verdict: Option<Verdict>,
}

/// Why a sub-task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FailureReason {
    RetriesExhausted { attempts: u32 },
    /// A dependency failed, so this sub-task's input can never materialize.
    Cascaded { upstream: SubTaskId },
    /// The run-wide attempt budget ran out before this sub-task was accepted.
    BudgetExhausted,
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            FailureReason::Cascaded { upstream } => write!(f, "upstream {} failed", upstream),
            FailureReason::BudgetExhausted => write!(f, "attempt budget exhausted"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Sub-task lifecycle state. `Accepted` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SubTaskState {
    /// Waiting on at least one dependency.
    Pending,
    /// Every dependency accepted; eligible for dispatch.
    Ready,
    /// An attempt is in flight.
    Dispatched,
    Accepted,
    /// Last attempt rejected; waiting out the retry backoff.
    Rejected { feedback: Feedback },
    Failed { reason: FailureReason },
}

impl Default for SubTaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl SubTaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubTaskState::Accepted | SubTaskState::Failed { .. })
    }

    /// Short label for events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            SubTaskState::Pending => "pending",
            SubTaskState::Ready => "ready",
            SubTaskState::Dispatched => "dispatched",
            SubTaskState::Accepted => "accepted",
            SubTaskState::Rejected { .. } => "rejected",
            SubTaskState::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for SubTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubTaskState::Rejected { feedback } => write!(f, "rejected: {}", feedback.summary),
            SubTaskState::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A single node of the task graph.
///
/// Identity, requirements and edges are fixed at planning time. Only the
/// state and attempt history change afterwards, and only through the
/// crate-internal transition methods driven by the supervisor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    id: SubTaskId,
    capability: Capability,
    /// Capability currently handling the sub-task; differs after escalation.
    routed: Capability,
    brief: String,
    params: BTreeMap<String, serde_json::Value>,
    inputs: Vec<SubTaskId>,
    acceptance: AcceptanceCriteria,
    output_bearing: bool,
    fallback: Option<Capability>,
    created_seq: usize,
    depth: usize,
    state: SubTaskState,
    attempts: Vec<Attempt>,
}

impl SubTask {
    pub(crate) fn from_plan(planned: PlannedSubTask, created_seq: usize) -> Self {
        Self {
            id: planned.id,
            capability: planned.capability,
            routed: planned.capability,
            brief: planned.brief,
            params: planned.params,
            inputs: planned.inputs,
            acceptance: planned.acceptance,
            output_bearing: planned.output_bearing,
            fallback: planned.fallback,
            created_seq,
            depth: 0,
            state: SubTaskState::Pending,
            attempts: Vec::new(),
        }
    }

    pub fn id(&self) -> &SubTaskId {
        &self.id
    }

    /// Capability the planner asked for.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Capability the next attempt will be dispatched to.
    pub fn routed(&self) -> Capability {
        self.routed
    }

    pub fn is_escalated(&self) -> bool {
        self.routed != self.capability
    }

    pub fn brief(&self) -> &str {
        &self.brief
    }

    pub fn params(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.params
    }

    /// Upstream sub-tasks whose artifacts feed this one.
    pub fn inputs(&self) -> &[SubTaskId] {
        &self.inputs
    }

    pub fn acceptance(&self) -> &AcceptanceCriteria {
        &self.acceptance
    }

    pub fn is_output_bearing(&self) -> bool {
        self.output_bearing
    }

    pub fn fallback(&self) -> Option<Capability> {
        self.fallback
    }

    /// Position in the planner's declaration order.
    pub fn created_seq(&self) -> usize {
        self.created_seq
    }

    /// Length of the longest dependency chain leading to this sub-task.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> &SubTaskState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Number of attempts dispatched to the given capability.
    pub fn attempts_on(&self, capability: Capability) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.capability == capability)
            .count() as u32
    }

    /// The artifact of the accepted attempt, when the sub-task is accepted.
    pub fn accepted_artifact(&self) -> Option<&Arc<Artifact>> {
        if self.state != SubTaskState::Accepted {
            return None;
        }
        self.attempts
            .iter()
            .rev()
            .find(|a| a.verdict.as_ref().is_some_and(Verdict::is_accept))
            .and_then(|a| a.outcome.artifact())
    }

    /// Feedback to hand to the next attempt, from the most recent rejection.
    pub fn pending_feedback(&self) -> Option<String> {
        self.attempts
            .last()
            .and_then(|a| a.verdict.as_ref())
            .and_then(Verdict::feedback)
            .map(Feedback::render)
    }

    // ========== State transitions (supervisor loop only) ==========

    pub(crate) fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    pub(crate) fn set_output_bearing(&mut self, output_bearing: bool) {
        self.output_bearing = output_bearing;
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = SubTaskState::Ready;
    }

    /// Move Ready -> Dispatched and open a new attempt. Returns its sequence number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        let seq = self.attempts.len() as u32 + 1;
        let feedback_in = self.pending_feedback();
        self.attempts.push(Attempt {
            seq,
            capability: self.routed,
            feedback_in,
            started_at: Utc::now(),
            finished_at: None,
            outcome: AttemptOutcome::InFlight,
            verdict: None,
        });
        self.state = SubTaskState::Dispatched;
        seq
    }

    /// Close the open attempt `seq`. Returns false when `seq` is not the
    /// open attempt, which means the result is stale and must be discarded.
    pub(crate) fn finish_attempt(&mut self, seq: u32, outcome: AttemptOutcome) -> bool {
        match self.attempts.last_mut() {
            Some(attempt) if attempt.seq == seq && attempt.outcome == AttemptOutcome::InFlight => {
                attempt.outcome = outcome;
                attempt.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_verdict(&mut self, seq: u32, verdict: Verdict) {
        if let Some(attempt) = self.attempts.iter_mut().find(|a| a.seq == seq) {
            attempt.verdict = Some(verdict);
        }
    }

    pub(crate) fn accept(&mut self) {
        self.state = SubTaskState::Accepted;
    }

    pub(crate) fn reject(&mut self, feedback: Feedback) {
        self.state = SubTaskState::Rejected { feedback };
    }

    /// Rejected -> Ready once the retry backoff has elapsed.
    pub(crate) fn requeue(&mut self) {
        if matches!(self.state, SubTaskState::Rejected { .. }) {
            self.state = SubTaskState::Ready;
        }
    }

    pub(crate) fn escalate(&mut self, to: Capability) {
        self.routed = to;
    }

    pub(crate) fn fail(&mut self, reason: FailureReason) {
        self.state = SubTaskState::Failed { reason };
    }

    /// Close an attempt left open by a stopped process and make the
    /// sub-task eligible again.
    pub(crate) fn interrupt(&mut self) {
        if let Some(seq) = self.attempts.last().map(|a| a.seq) {
            self.finish_attempt(seq, AttemptOutcome::Interrupted);
        }
        self.state = SubTaskState::Ready;
    }
}
