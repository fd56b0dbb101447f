//! Supervisor control loop.
//!
//! The supervisor owns a run from planning to its terminal status. Each
//! iteration dispatches newly ready work, waits for the next attempt
//! completion (or a retry backoff, or cancellation), judges the result and
//! applies the retry policy. Every graph mutation happens on this loop;
//! attempts only hand their results back through the scheduler's channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::dag::{GraphSnapshot, TaskGraph};
use crate::core::plan::Decomposition;
use crate::core::task::{
    Attempt, AttemptOutcome, Capability, FailureReason, Feedback, Provenance, SubTask, SubTaskId,
    SubTaskState, Verdict,
};
use crate::error::RunError;
use crate::orchestration::critic::CriticRegistry;
use crate::orchestration::planner::Planner;
use crate::orchestration::policy::{Action, DefaultRetryPolicy, RetryPolicy};
use crate::orchestration::pool::AgentPool;
use crate::orchestration::scheduler::{AttemptEvent, AttemptResult, Scheduler};
use crate::orchestration::synthesizer::{FinalOutput, Synthesizer};
use crate::run::{RunId, RunState, RunStatus, StatusHistoryEntry};
use crate::state::events::{outcome_label, EventSink, LifecycleEvent, TracingSink};
use crate::state::snapshot::RunSnapshot;

/// One failed sub-task in a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub subtask: SubTaskId,
    pub capability: Capability,
    pub reason: FailureReason,
    /// Full attempt history, oldest first.
    pub attempts: Vec<Attempt>,
}

impl FailureRecord {
    fn from_subtask(task: &SubTask) -> Option<Self> {
        match task.state() {
            SubTaskState::Failed { reason } => Some(Self {
                subtask: task.id().clone(),
                capability: task.capability(),
                reason: reason.clone(),
                attempts: task.attempts().to_vec(),
            }),
            _ => None,
        }
    }

    /// True when the sub-task failed on its own account rather than
    /// through a failed dependency.
    pub fn is_root_cause(&self) -> bool {
        !matches!(self.reason, FailureReason::Cascaded { .. })
    }
}

/// What the caller gets back from a run: the output if there is one, and
/// enough state to diagnose every failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub request: String,
    pub status: RunStatus,
    pub output: Option<FinalOutput>,
    /// Failed sub-tasks in topological order.
    pub failures: Vec<FailureRecord>,
    pub graph: GraphSnapshot,
    pub history: Vec<StatusHistoryEntry>,
}

impl RunReport {
    fn new(run: &RunState, graph: &TaskGraph, output: Option<FinalOutput>) -> Self {
        Self {
            run_id: run.id(),
            request: run.request().to_string(),
            status: run.status(),
            output,
            failures: graph
                .topological_order()
                .into_iter()
                .filter_map(FailureRecord::from_subtask)
                .collect(),
            graph: graph.snapshot(),
            history: run.history().to_vec(),
        }
    }

    /// Sub-tasks that never reached a terminal state.
    pub fn unfinished(&self) -> Vec<&SubTask> {
        self.graph.nodes.iter().filter(|t| !t.is_terminal()).collect()
    }

    /// Failures that were not cascaded from a dependency.
    pub fn root_causes(&self) -> Vec<&FailureRecord> {
        self.failures.iter().filter(|f| f.is_root_cause()).collect()
    }

    pub fn failure(&self, id: &SubTaskId) -> Option<&FailureRecord> {
        self.failures.iter().find(|f| &f.subtask == id)
    }

    pub fn subtask(&self, id: &SubTaskId) -> Option<&SubTask> {
        self.graph.nodes.iter().find(|t| t.id() == id)
    }
}

/// Last state label announced per sub-task, used to emit `StateChanged`.
type Labels = HashMap<SubTaskId, &'static str>;

/// Drives runs to completion.
///
/// A supervisor can execute several runs; each one gets its own copy of
/// the agent pool, its own task graph and a child of the supervisor's
/// cancellation token.
pub struct Supervisor {
    pool: AgentPool,
    critics: CriticRegistry,
    policy: Arc<dyn RetryPolicy>,
    synthesizer: Synthesizer,
    sink: Arc<dyn EventSink>,
    attempt_timeout: Duration,
    max_plan_steps: Option<usize>,
    max_total_attempts: Option<u32>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Build a supervisor with the retry, timeout and budget settings of
    /// `config`. Concurrency limits come from `pool`.
    pub fn new(config: &Config, pool: AgentPool) -> Self {
        let policy = config.escalation.iter().fold(
            DefaultRetryPolicy::new(config.max_retries)
                .with_backoff(config.base_backoff(), config.max_backoff()),
            |policy, rule| policy.with_escalation(rule.from, rule.to),
        );
        Self {
            pool,
            critics: CriticRegistry::new(),
            policy: Arc::new(policy),
            synthesizer: Synthesizer::new(),
            sink: Arc::new(TracingSink),
            attempt_timeout: config.attempt_timeout(),
            max_plan_steps: Some(config.max_plan_steps),
            max_total_attempts: config.max_total_attempts,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_critics(mut self, critics: CriticRegistry) -> Self {
        self.critics = critics;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Synthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_attempt_budget(mut self, max_total_attempts: Option<u32>) -> Self {
        self.max_total_attempts = max_total_attempts;
        self
    }

    /// Token that aborts every run of this supervisor when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Ask `planner` for a decomposition of `request`, then execute it.
    pub async fn run(&self, request: &str, planner: &dyn Planner) -> Result<RunReport, RunError> {
        let decomposition = planner
            .plan(request)
            .await
            .map_err(|e| RunError::Planner(e.to_string()))?;
        self.execute(request, decomposition).await
    }

    /// Validate `decomposition` and drive it to a terminal status.
    ///
    /// Planning errors and stalls are returned as `Err`. Every other
    /// outcome, including `Aborted`, comes back as a report.
    pub async fn execute(
        &self,
        request: &str,
        decomposition: Decomposition,
    ) -> Result<RunReport, RunError> {
        let mut run = RunState::new(request);
        let run_id = run.id();
        info!(run_id = %run_id, subtasks = decomposition.subtasks.len(), "Planning run");

        let graph = match TaskGraph::build_with_limit(decomposition, self.max_plan_steps) {
            Ok(graph) => graph,
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Plan rejected");
                self.set_status(&mut run, RunStatus::Aborted);
                self.emit(LifecycleEvent::RunFinished {
                    run_id,
                    at: Utc::now(),
                    status: run.status(),
                });
                return Err(RunError::Planning(err));
            }
        };

        self.emit(LifecycleEvent::RunStarted {
            run_id,
            at: Utc::now(),
            request: request.to_string(),
            subtasks: graph.len(),
        });
        self.set_status(&mut run, RunStatus::Running);

        let labels: Labels = graph
            .nodes()
            .map(|t| (t.id().clone(), SubTaskState::Pending.label()))
            .collect();
        self.drive(run, graph, labels, Vec::new()).await
    }

    /// Continue a run from its last snapshot.
    ///
    /// Terminal runs are reported as they were saved. Attempts that were in
    /// flight when the snapshot was taken are closed as interrupted and
    /// their sub-tasks dispatched again; rejected sub-tasks retry at once.
    pub async fn resume(&self, snapshot: RunSnapshot) -> Result<RunReport, RunError> {
        let RunSnapshot {
            mut run,
            graph,
            output,
            ..
        } = snapshot;
        let run_id = run.id();
        let mut graph = TaskGraph::restore(graph)?;

        if run.is_terminal() {
            info!(run_id = %run_id, status = %run.status(), "Run already finished");
            return Ok(RunReport::new(&run, &graph, output));
        }
        if run.status() == RunStatus::Planning {
            self.set_status(&mut run, RunStatus::Running);
        }

        let labels: Labels = graph
            .nodes()
            .map(|t| (t.id().clone(), t.state().label()))
            .collect();

        let mut retries = Vec::new();
        let ids: Vec<SubTaskId> = graph.nodes().map(|t| t.id().clone()).collect();
        for id in ids {
            let Some(task) = graph.get_mut(&id) else {
                continue;
            };
            match task.state() {
                SubTaskState::Dispatched => {
                    task.interrupt();
                    if let Some(attempt) = task.last_attempt() {
                        self.emit(LifecycleEvent::AttemptFinished {
                            run_id,
                            at: Utc::now(),
                            subtask: id.clone(),
                            attempt: attempt.seq,
                            outcome: outcome_label(&attempt.outcome).to_string(),
                        });
                    }
                }
                SubTaskState::Rejected { .. } => retries.push(id),
                _ => {}
            }
        }

        info!(
            run_id = %run_id,
            attempts = graph.total_attempts(),
            retries = retries.len(),
            "Resuming run"
        );
        self.drive(run, graph, labels, retries).await
    }

    async fn drive(
        &self,
        mut run: RunState,
        mut graph: TaskGraph,
        mut labels: Labels,
        retries: Vec<SubTaskId>,
    ) -> Result<RunReport, RunError> {
        let run_id = run.id();
        let token = self.cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(run_id, self.pool.fresh(), token.clone(), tx)
            .with_attempt_timeout(self.attempt_timeout)
            .with_attempt_budget(self.max_total_attempts)
            .with_attempts_started(graph.total_attempts());
        for id in retries {
            scheduler.schedule_retry(id, Duration::ZERO);
        }

        self.sync_states(run_id, &graph, &mut labels);
        self.checkpoint(&run, &graph, None);

        loop {
            if token.is_cancelled() {
                return Ok(self.abort_cancelled(run, graph, labels, &mut scheduler));
            }

            let dispatched = scheduler.tick(&mut graph);
            for id in &dispatched {
                if let Some(attempt) = graph.get(id).and_then(SubTask::last_attempt) {
                    self.emit(LifecycleEvent::AttemptStarted {
                        run_id,
                        at: Utc::now(),
                        subtask: id.clone(),
                        attempt: attempt.seq,
                        capability: attempt.capability,
                    });
                }
            }
            if !dispatched.is_empty() {
                self.sync_states(run_id, &graph, &mut labels);
                self.checkpoint(&run, &graph, None);
            }

            if graph.is_complete() {
                break;
            }

            if scheduler.in_flight_count() == 0 {
                if scheduler.budget_exhausted() {
                    self.exhaust_budget(run_id, &mut graph, &mut scheduler);
                    self.sync_states(run_id, &graph, &mut labels);
                    continue;
                }
                if !scheduler.has_pending_retries() {
                    return Err(self.stall(run, graph, labels, &mut scheduler));
                }
            }

            let next_retry = scheduler.next_retry_at();
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                event = rx.recv() => {
                    if let Some(event) = event {
                        self.handle_completion(run_id, &mut graph, &mut scheduler, event);
                        self.sync_states(run_id, &graph, &mut labels);
                        self.checkpoint(&run, &graph, None);
                    }
                }
                _ = wait_until(next_retry) => {}
            }
        }

        let output = match self.synthesizer.synthesize(run_id, &graph) {
            Ok(output) => Some(output),
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "Nothing to synthesize");
                None
            }
        };
        let status = match &output {
            Some(_) if graph.all_accepted() => RunStatus::Completed,
            Some(_) => RunStatus::PartiallyCompleted,
            None => RunStatus::Aborted,
        };
        self.set_status(&mut run, status);
        Ok(self.finish(run, graph, output))
    }

    /// Judge one completed attempt and apply the policy decision.
    fn handle_completion(
        &self,
        run_id: RunId,
        graph: &mut TaskGraph,
        scheduler: &mut Scheduler,
        event: AttemptEvent,
    ) {
        if !scheduler.complete(&event) {
            debug!(
                run_id = %run_id,
                subtask = %event.subtask,
                attempt = event.attempt,
                "Discarding stale attempt result"
            );
            return;
        }

        let id = event.subtask.clone();
        let outcome = match event.result {
            AttemptResult::Produced(output) => {
                let provenance = Provenance {
                    subtask: id.clone(),
                    attempt: event.attempt,
                };
                AttemptOutcome::Produced {
                    artifact: Arc::new(output.into_artifact(event.capability, provenance)),
                }
            }
            AttemptResult::Failed(err) => AttemptOutcome::Errored {
                error: err.to_string(),
            },
            AttemptResult::TimedOut => AttemptOutcome::TimedOut,
            AttemptResult::Cancelled => AttemptOutcome::Cancelled,
        };

        let Some(task) = graph.get_mut(&id) else {
            return;
        };
        if !task.finish_attempt(event.attempt, outcome.clone()) {
            return;
        }
        self.emit(LifecycleEvent::AttemptFinished {
            run_id,
            at: Utc::now(),
            subtask: id.clone(),
            attempt: event.attempt,
            outcome: outcome_label(&outcome).to_string(),
        });

        let verdict = match &outcome {
            AttemptOutcome::Produced { artifact } => self.critics.evaluate(task, artifact),
            AttemptOutcome::Errored { error } => Verdict::Reject {
                feedback: Feedback::new(error.clone()),
            },
            AttemptOutcome::TimedOut => Verdict::Reject {
                feedback: Feedback::timeout(),
            },
            AttemptOutcome::Cancelled => Verdict::reject("attempt was cancelled by the agent"),
            AttemptOutcome::InFlight | AttemptOutcome::Interrupted => {
                Verdict::reject("attempt was interrupted")
            }
        };
        task.record_verdict(event.attempt, verdict.clone());
        self.emit(LifecycleEvent::VerdictRecorded {
            run_id,
            at: Utc::now(),
            subtask: id.clone(),
            attempt: event.attempt,
            verdict: verdict.clone(),
        });

        let feedback = match &verdict {
            Verdict::Accept => {
                debug!(run_id = %run_id, subtask = %id, attempt = event.attempt, "Artifact accepted");
                task.accept();
                return;
            }
            Verdict::Reject { feedback } => feedback.clone(),
        };

        task.reject(feedback);
        match self.policy.decide(task, &verdict) {
            Action::RetrySameAgent { delay } => {
                debug!(run_id = %run_id, subtask = %id, ?delay, "Retrying on same capability");
                scheduler.schedule_retry(id, delay);
            }
            Action::EscalateToDifferentCapability { to, delay } => {
                let from = task.routed();
                task.escalate(to);
                info!(run_id = %run_id, subtask = %id, %from, %to, "Escalating sub-task");
                self.emit(LifecycleEvent::Escalated {
                    run_id,
                    at: Utc::now(),
                    subtask: id.clone(),
                    from,
                    to,
                });
                scheduler.schedule_retry(id, delay);
            }
            Action::Abandon => {
                let attempts = task.attempts().len() as u32;
                warn!(run_id = %run_id, subtask = %id, attempts, "Sub-task failed");
                task.fail(FailureReason::RetriesExhausted { attempts });
                self.cascade(run_id, graph, &id);
            }
        }
    }

    fn cascade(&self, run_id: RunId, graph: &mut TaskGraph, failed: &SubTaskId) {
        for id in graph.fail_cascade(failed) {
            self.emit(LifecycleEvent::CascadedFailure {
                run_id,
                at: Utc::now(),
                subtask: id,
                upstream: failed.clone(),
            });
        }
    }

    /// Fail whatever is left once the run-wide attempt budget is spent.
    fn exhaust_budget(&self, run_id: RunId, graph: &mut TaskGraph, scheduler: &mut Scheduler) {
        warn!(
            run_id = %run_id,
            attempts = scheduler.attempts_started(),
            "Attempt budget exhausted"
        );
        let open: Vec<SubTaskId> = graph
            .topological_order()
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id().clone())
            .collect();
        for id in open {
            scheduler.clear_retry(&id);
            match graph.get_mut(&id) {
                Some(task) if !task.is_terminal() => task.fail(FailureReason::BudgetExhausted),
                _ => continue,
            }
            self.cascade(run_id, graph, &id);
        }
    }

    fn abort_cancelled(
        &self,
        mut run: RunState,
        mut graph: TaskGraph,
        mut labels: Labels,
        scheduler: &mut Scheduler,
    ) -> RunReport {
        let run_id = run.id();
        let open = scheduler.cancel_all();
        warn!(run_id = %run_id, in_flight = open.len(), "Run cancelled");

        for (id, attempt) in open {
            if let Some(task) = graph.get_mut(&id) {
                if task.finish_attempt(attempt, AttemptOutcome::Cancelled) {
                    self.emit(LifecycleEvent::AttemptFinished {
                        run_id,
                        at: Utc::now(),
                        subtask: id.clone(),
                        attempt,
                        outcome: outcome_label(&AttemptOutcome::Cancelled).to_string(),
                    });
                }
            }
        }
        let open: Vec<SubTaskId> = graph.unfinished().iter().map(|t| t.id().clone()).collect();
        for id in open {
            if let Some(task) = graph.get_mut(&id) {
                task.fail(FailureReason::Cancelled);
            }
        }

        self.sync_states(run_id, &graph, &mut labels);
        self.set_status(&mut run, RunStatus::Aborted);
        self.finish(run, graph, None)
    }

    fn stall(
        &self,
        mut run: RunState,
        graph: TaskGraph,
        mut labels: Labels,
        scheduler: &mut Scheduler,
    ) -> RunError {
        let run_id = run.id();
        let unfinished: Vec<String> = graph.unfinished().iter().map(|t| t.id().to_string()).collect();
        error!(run_id = %run_id, unfinished = ?unfinished, "Run stalled");
        scheduler.cancel_all();

        self.sync_states(run_id, &graph, &mut labels);
        self.set_status(&mut run, RunStatus::Aborted);
        RunError::Stalled(Box::new(self.finish(run, graph, None)))
    }

    fn finish(&self, run: RunState, graph: TaskGraph, output: Option<FinalOutput>) -> RunReport {
        let run_id = run.id();
        info!(
            run_id = %run_id,
            status = %run.status(),
            accepted = graph.count_in("accepted"),
            failed = graph.count_in("failed"),
            "Run finished"
        );
        self.emit(LifecycleEvent::RunFinished {
            run_id,
            at: Utc::now(),
            status: run.status(),
        });
        self.checkpoint(&run, &graph, output.clone());
        RunReport::new(&run, &graph, output)
    }

    fn set_status(&self, run: &mut RunState, status: RunStatus) {
        if let Err(err) = run.transition(status) {
            warn!(run_id = %run.id(), error = %err, "Ignoring run transition");
        }
    }

    /// Emit `StateChanged` for every sub-task whose state moved since the
    /// last call, in creation order.
    fn sync_states(&self, run_id: RunId, graph: &TaskGraph, labels: &mut Labels) {
        for task in graph.nodes() {
            let to = task.state().label();
            let from = labels.insert(task.id().clone(), to);
            if let Some(from) = from.filter(|from| *from != to) {
                self.emit(LifecycleEvent::StateChanged {
                    run_id,
                    at: Utc::now(),
                    subtask: task.id().clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
    }

    fn checkpoint(&self, run: &RunState, graph: &TaskGraph, output: Option<FinalOutput>) {
        self.sink
            .checkpoint(&RunSnapshot::new(run.clone(), graph.snapshot(), output));
    }

    fn emit(&self, event: LifecycleEvent) {
        self.sink.emit(&event);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
