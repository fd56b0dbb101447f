//! Scheduler for parallel attempt execution.
//!
//! The Scheduler walks the task graph for ready sub-tasks and dispatches
//! them to free agent handles while respecting the pool's concurrency
//! limits. Dispatch never blocks: every attempt runs on its own tokio task
//! and reports back through an unbounded completion channel that the
//! supervisor loop drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::dag::TaskGraph;
use crate::core::task::{Capability, SubTaskId};
use crate::error::AgentError;
use crate::orchestration::agent::{AgentHandle, AgentOutput, AttemptRequest};
use crate::orchestration::pool::AgentPool;
use crate::run::RunId;

/// Default per-attempt timeout (5 minutes).
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// What came back from one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Produced(AgentOutput),
    Failed(AgentError),
    TimedOut,
    Cancelled,
}

/// Completion of one attempt, delivered on the scheduler's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptEvent {
    pub subtask: SubTaskId,
    pub attempt: u32,
    pub capability: Capability,
    pub result: AttemptResult,
}

struct InFlight {
    attempt: u32,
    slot: Option<(Capability, usize)>,
    cancel: CancellationToken,
}

/// Dispatches ready sub-tasks and tracks attempts in flight.
///
/// The scheduler never mutates the graph from another task: it only opens
/// attempts during [`Scheduler::tick`], which runs on the supervisor loop.
pub struct Scheduler {
    run_id: RunId,
    pool: AgentPool,
    attempt_timeout: Duration,
    /// Run-level token. Every attempt gets a child of it.
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<AttemptEvent>,
    in_flight: HashMap<SubTaskId, InFlight>,
    /// Rejected sub-tasks waiting out their backoff.
    retry_at: HashMap<SubTaskId, Instant>,
    attempts_started: u32,
    max_total_attempts: Option<u32>,
}

impl Scheduler {
    pub fn new(
        run_id: RunId,
        pool: AgentPool,
        cancel: CancellationToken,
        completions: mpsc::UnboundedSender<AttemptEvent>,
    ) -> Self {
        Self {
            run_id,
            pool,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            cancel,
            completions,
            in_flight: HashMap::new(),
            retry_at: HashMap::new(),
            attempts_started: 0,
            max_total_attempts: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Cap the number of attempts dispatched over the whole run.
    pub fn with_attempt_budget(mut self, max_total_attempts: Option<u32>) -> Self {
        self.max_total_attempts = max_total_attempts;
        self
    }

    /// Count attempts made before this scheduler existed (resumed runs).
    pub fn with_attempts_started(mut self, attempts: u32) -> Self {
        self.attempts_started = attempts;
        self
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: &SubTaskId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn has_pending_retries(&self) -> bool {
        !self.retry_at.is_empty()
    }

    /// Nothing in flight and nothing waiting on a backoff.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.retry_at.is_empty()
    }

    pub fn attempts_started(&self) -> u32 {
        self.attempts_started
    }

    pub fn budget_exhausted(&self) -> bool {
        self.max_total_attempts
            .is_some_and(|max| self.attempts_started >= max)
    }

    /// Earliest instant at which a rejected sub-task becomes ready again.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry_at.values().min().copied()
    }

    /// Requeue `id` once `delay` has elapsed.
    pub fn schedule_retry(&mut self, id: SubTaskId, delay: Duration) {
        self.retry_at.insert(id, Instant::now() + delay);
    }

    pub fn clear_retry(&mut self, id: &SubTaskId) {
        self.retry_at.remove(id);
    }

    /// Dispatch as many ready sub-tasks as capacity allows.
    ///
    /// Rejected sub-tasks whose backoff has elapsed are requeued first.
    /// Ready sub-tasks are taken in planner order. A sub-task whose
    /// capability has handles but none free stays `Ready`.
    /// A sub-task whose capability has no handles at all gets an attempt
    /// that fails immediately with `UnknownCapability`.
    ///
    /// Returns the ids that received a new attempt.
    pub fn tick(&mut self, graph: &mut TaskGraph) -> Vec<SubTaskId> {
        self.release_elapsed_retries(graph);

        let mut dispatched = Vec::new();
        for id in graph.ready_nodes() {
            if self.cancel.is_cancelled() || self.budget_exhausted() || !self.pool.has_capacity() {
                break;
            }
            let Some(capability) = graph.get(&id).map(|t| t.routed()) else {
                continue;
            };

            if !self.pool.knows(capability) {
                let Some(attempt) = self.open_attempt(graph, &id, None) else {
                    continue;
                };
                warn!(
                    run_id = %self.run_id,
                    subtask = %id,
                    attempt,
                    %capability,
                    "No agent registered for capability"
                );
                let _ = self.completions.send(AttemptEvent {
                    subtask: id.clone(),
                    attempt,
                    capability,
                    result: AttemptResult::Failed(AgentError::UnknownCapability { capability }),
                });
                dispatched.push(id);
                continue;
            }

            let Some(lease) = self.pool.acquire(capability) else {
                debug!(subtask = %id, %capability, "No free agent, staying ready");
                continue;
            };
            let Some(attempt) = self.open_attempt(graph, &id, Some((capability, lease.slot))) else {
                self.pool.release(&lease);
                continue;
            };
            let Some(request) = self.request_for(graph, &id, attempt, capability) else {
                continue;
            };
            let token = match self.in_flight.get(&id) {
                Some(flight) => flight.cancel.clone(),
                None => continue,
            };

            debug!(
                run_id = %self.run_id,
                subtask = %id,
                attempt,
                agent = %lease.handle.name(),
                "Dispatching attempt"
            );
            self.spawn_attempt(Arc::clone(&lease.handle), request, token);
            dispatched.push(id);
        }

        dispatched
    }

    /// Accept a completion from the channel.
    ///
    /// Returns false when the event does not belong to the open attempt of
    /// its sub-task. Such results are stale and must be discarded.
    pub fn complete(&mut self, event: &AttemptEvent) -> bool {
        match self.in_flight.get(&event.subtask) {
            Some(flight) if flight.attempt == event.attempt => {}
            _ => return false,
        }
        if let Some(flight) = self.in_flight.remove(&event.subtask) {
            if let Some((capability, slot)) = flight.slot {
                self.pool.release_slot(capability, slot);
            }
        }
        true
    }

    /// Signal cancellation to every attempt and stop dispatching.
    ///
    /// Returns the attempts that were still open, sorted by sub-task id.
    pub fn cancel_all(&mut self) -> Vec<(SubTaskId, u32)> {
        self.cancel.cancel();
        self.retry_at.clear();

        let drained: Vec<(SubTaskId, InFlight)> = self.in_flight.drain().collect();
        let mut open = Vec::with_capacity(drained.len());
        for (id, flight) in drained {
            flight.cancel.cancel();
            if let Some((capability, slot)) = flight.slot {
                self.pool.release_slot(capability, slot);
            }
            open.push((id, flight.attempt));
        }
        open.sort();
        open
    }

    fn release_elapsed_retries(&mut self, graph: &mut TaskGraph) {
        let now = Instant::now();
        let due: Vec<SubTaskId> = self
            .retry_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.retry_at.remove(&id);
            if let Some(task) = graph.get_mut(&id) {
                task.requeue();
            }
        }
    }

    fn open_attempt(
        &mut self,
        graph: &mut TaskGraph,
        id: &SubTaskId,
        slot: Option<(Capability, usize)>,
    ) -> Option<u32> {
        let task = graph.get_mut(id)?;
        let attempt = task.begin_attempt();
        self.attempts_started += 1;
        self.in_flight.insert(
            id.clone(),
            InFlight {
                attempt,
                slot,
                cancel: self.cancel.child_token(),
            },
        );
        Some(attempt)
    }

    fn request_for(
        &self,
        graph: &TaskGraph,
        id: &SubTaskId,
        attempt: u32,
        capability: Capability,
    ) -> Option<AttemptRequest> {
        let task = graph.get(id)?;
        Some(AttemptRequest {
            run_id: self.run_id,
            subtask: id.clone(),
            attempt,
            capability,
            brief: task.brief().to_string(),
            params: task.params().clone(),
            inputs: graph.upstream_artifacts(id),
            feedback: task.last_attempt().and_then(|a| a.feedback_in.clone()),
        })
    }

    fn spawn_attempt(
        &self,
        handle: Arc<dyn AgentHandle>,
        request: AttemptRequest,
        token: CancellationToken,
    ) {
        let completions = self.completions.clone();
        let timeout = self.attempt_timeout;
        let subtask = request.subtask.clone();
        let attempt = request.attempt;
        let capability = request.capability;

        tokio::spawn(async move {
            let agent_token = token.clone();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => AttemptResult::Cancelled,
                outcome = tokio::time::timeout(timeout, handle.dispatch(request, agent_token)) => {
                    match outcome {
                        Ok(Ok(output)) => AttemptResult::Produced(output),
                        Ok(Err(AgentError::Cancelled)) => AttemptResult::Cancelled,
                        Ok(Err(err)) => AttemptResult::Failed(err),
                        Err(_) => {
                            token.cancel();
                            AttemptResult::TimedOut
                        }
                    }
                }
            };
            let _ = completions.send(AttemptEvent {
                subtask,
                attempt,
                capability,
                result,
            });
        });
    }
}
