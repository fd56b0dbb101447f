//! Lifecycle events and the sinks that receive them.
//!
//! The supervisor emits one event per state transition, attempt, verdict
//! and run outcome. Sinks are append-only; the core never reads them back.
//! Snapshots for the resume path arrive through [`EventSink::checkpoint`].

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::task::{AttemptOutcome, Capability, SubTaskId, Verdict};
use crate::error::Result;
use crate::run::{RunId, RunStatus};
use crate::state::snapshot::RunSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum LifecycleEvent {
    RunStarted {
        run_id: RunId,
        at: DateTime<Utc>,
        request: String,
        subtasks: usize,
    },
    StateChanged {
        run_id: RunId,
        at: DateTime<Utc>,
        subtask: SubTaskId,
        from: String,
        to: String,
    },
    AttemptStarted {
        run_id: RunId,
        at: DateTime<Utc>,
        subtask: SubTaskId,
        attempt: u32,
        capability: Capability,
    },
    AttemptFinished {
        run_id: RunId,
        at: DateTime<Utc>,
        subtask: SubTaskId,
        attempt: u32,
        outcome: String,
    },
    VerdictRecorded {
        run_id: RunId,
        at: DateTime<Utc>,
        subtask: SubTaskId,
        attempt: u32,
        verdict: Verdict,
    },
    Escalated {
        run_id: RunId,
        at: DateTime<Utc>,
        subtask: SubTaskId,
        from: Capability,
        to: Capability,
    },
    CascadedFailure {
        run_id: RunId,
        at: DateTime<Utc>,
        subtask: SubTaskId,
        upstream: SubTaskId,
    },
    RunFinished {
        run_id: RunId,
        at: DateTime<Utc>,
        status: RunStatus,
    },
}

impl LifecycleEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            LifecycleEvent::RunStarted { run_id, .. }
            | LifecycleEvent::StateChanged { run_id, .. }
            | LifecycleEvent::AttemptStarted { run_id, .. }
            | LifecycleEvent::AttemptFinished { run_id, .. }
            | LifecycleEvent::VerdictRecorded { run_id, .. }
            | LifecycleEvent::Escalated { run_id, .. }
            | LifecycleEvent::CascadedFailure { run_id, .. }
            | LifecycleEvent::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Event name as it appears in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RunStarted { .. } => "run_started",
            LifecycleEvent::StateChanged { .. } => "state_changed",
            LifecycleEvent::AttemptStarted { .. } => "attempt_started",
            LifecycleEvent::AttemptFinished { .. } => "attempt_finished",
            LifecycleEvent::VerdictRecorded { .. } => "verdict_recorded",
            LifecycleEvent::Escalated { .. } => "escalated",
            LifecycleEvent::CascadedFailure { .. } => "cascaded_failure",
            LifecycleEvent::RunFinished { .. } => "run_finished",
        }
    }

    /// The sub-task the event is about, if any.
    pub fn subtask(&self) -> Option<&SubTaskId> {
        match self {
            LifecycleEvent::StateChanged { subtask, .. }
            | LifecycleEvent::AttemptStarted { subtask, .. }
            | LifecycleEvent::AttemptFinished { subtask, .. }
            | LifecycleEvent::VerdictRecorded { subtask, .. }
            | LifecycleEvent::Escalated { subtask, .. }
            | LifecycleEvent::CascadedFailure { subtask, .. } => Some(subtask),
            LifecycleEvent::RunStarted { .. } | LifecycleEvent::RunFinished { .. } => None,
        }
    }
}

/// Short label for an attempt outcome.
pub fn outcome_label(outcome: &AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::InFlight => "in_flight",
        AttemptOutcome::Produced { .. } => "produced",
        AttemptOutcome::Errored { .. } => "errored",
        AttemptOutcome::TimedOut => "timed_out",
        AttemptOutcome::Cancelled => "cancelled",
        AttemptOutcome::Interrupted => "interrupted",
    }
}

/// Append-only receiver of lifecycle events.
///
/// Sinks must not fail the run: I/O problems are logged and swallowed.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);

    /// Receive a full snapshot after the run's state changed.
    fn checkpoint(&self, _snapshot: &RunSnapshot) {}
}

/// Writes every event to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        let subtask = event.subtask().map(|s| s.as_str()).unwrap_or("-");
        match event {
            LifecycleEvent::StateChanged { from, to, .. } => {
                info!(run_id = %event.run_id(), subtask, from = %from, to = %to, "state_changed");
            }
            LifecycleEvent::AttemptStarted {
                attempt, capability, ..
            } => {
                info!(run_id = %event.run_id(), subtask, attempt, %capability, "attempt_started");
            }
            LifecycleEvent::AttemptFinished {
                attempt, outcome, ..
            } => {
                info!(run_id = %event.run_id(), subtask, attempt, outcome = %outcome, "attempt_finished");
            }
            LifecycleEvent::VerdictRecorded {
                attempt, verdict, ..
            } => {
                info!(run_id = %event.run_id(), subtask, attempt, accepted = verdict.is_accept(), "verdict_recorded");
            }
            LifecycleEvent::Escalated { from, to, .. } => {
                info!(run_id = %event.run_id(), subtask, %from, %to, "escalated");
            }
            LifecycleEvent::CascadedFailure { upstream, .. } => {
                info!(run_id = %event.run_id(), subtask, upstream = %upstream, "cascaded_failure");
            }
            LifecycleEvent::RunStarted { subtasks, .. } => {
                info!(run_id = %event.run_id(), subtasks, "run_started");
            }
            LifecycleEvent::RunFinished { status, .. } => {
                info!(run_id = %event.run_id(), %status, "run_finished");
            }
        }
    }
}

/// Appends events as JSON lines to a file.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &LifecycleEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "Failed to serialize lifecycle event");
                return;
            }
        };
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{}", line) {
                    warn!(error = %err, "Failed to append lifecycle event");
                }
            }
            Err(_) => warn!("Event log lock poisoned"),
        }
    }
}

/// Keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
    snapshots: Mutex<Vec<RunSnapshot>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Every checkpoint received, oldest first.
    pub fn snapshots(&self) -> Vec<RunSnapshot> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_snapshot(&self) -> Option<RunSnapshot> {
        self.snapshots.lock().ok().and_then(|s| s.last().cloned())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }

    fn checkpoint(&self, snapshot: &RunSnapshot) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(snapshot.clone());
        }
    }
}

/// Forwards to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    fn checkpoint(&self, snapshot: &RunSnapshot) {
        for sink in &self.sinks {
            sink.checkpoint(snapshot);
        }
    }
}
