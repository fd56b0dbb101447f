//! Run state management with status transition validation.
//!
//! `RunState` tracks a run's status and enforces the phase machine
//! `Planning -> Running -> {Completed, PartiallyCompleted, Aborted}`.
//! A run may also abort straight out of planning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{RunId, RunStatus};

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: RunStatus,
    pub entered_at: DateTime<Utc>,
}

/// Identity, request and status history of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    id: RunId,
    /// The user request the run was started for.
    request: String,
    status: RunStatus,
    history: Vec<StatusHistoryEntry>,
}

impl RunState {
    /// Create a run in `Planning`.
    pub fn new(request: impl Into<String>) -> Self {
        Self::with_id(RunId::new(), request)
    }

    pub fn with_id(id: RunId, request: impl Into<String>) -> Self {
        Self {
            id,
            request: request.into(),
            status: RunStatus::Planning,
            history: vec![StatusHistoryEntry {
                status: RunStatus::Planning,
                entered_at: Utc::now(),
            }],
        }
    }

    /// Check if a transition to `target` is valid from the current status.
    pub fn can_transition(&self, target: RunStatus) -> bool {
        matches!(
            (self.status, target),
            (RunStatus::Planning, RunStatus::Running)
                | (RunStatus::Planning, RunStatus::Aborted)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::PartiallyCompleted)
                | (RunStatus::Running, RunStatus::Aborted)
        )
    }

    /// Move the run to `target`.
    ///
    /// # Errors
    /// Returns `Error::InvalidRunTransition` when the phase machine does not
    /// allow the move.
    pub fn transition(&mut self, target: RunStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidRunTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        self.status = target;
        self.history.push(StatusHistoryEntry {
            status: target,
            entered_at: Utc::now(),
        });

        Ok(())
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// All statuses visited, in order.
    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.history
    }
}
