use thiserror::Error;

use crate::core::task::{Capability, SubTaskId};
use crate::orchestration::RunReport;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid run transition from {from} to {to}")]
    InvalidRunTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structural problems found while building a task graph. Fatal to the run:
/// nothing is dispatched when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Plan contains no sub-tasks")]
    EmptyPlan,

    #[error("Plan has {count} sub-tasks, more than the allowed {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("Sub-task {id} is declared more than once")]
    DuplicateSubTask { id: SubTaskId },

    #[error("Sub-task {id} depends on itself")]
    SelfDependency { id: SubTaskId },

    #[error("Sub-task {from} references undeclared sub-task {to}")]
    DanglingReference { from: SubTaskId, to: SubTaskId },

    #[error("Dependency cycle detected at sub-task {node}")]
    CyclicDependency { node: SubTaskId },
}

/// Failures reported by an agent handle for a single attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("No {capability} agent is available")]
    Unavailable { capability: Capability },

    #[error("No agent is registered for capability {capability}")]
    UnknownCapability { capability: Capability },

    #[error("Agent failed: {0}")]
    Failed(String),

    #[error("Attempt was cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("No output-bearing sub-task was accepted")]
    InsufficientArtifacts,
}

/// Run-level conditions surfaced to the caller as hard failures.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("{0}")]
    Planning(#[from] PlanningError),

    #[error("Planner failed: {0}")]
    Planner(String),

    #[error("Run {} stalled with {} unfinished sub-tasks", .0.run_id, .0.unfinished().len())]
    Stalled(Box<RunReport>),
}
