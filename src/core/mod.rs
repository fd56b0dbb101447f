//! Core domain models for Briareus orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: sub-tasks, planner decompositions and the
//! task graph built from them.

pub mod dag;
pub mod plan;
pub mod task;

pub use dag::{GraphSnapshot, TaskGraph};
pub use plan::{Decomposition, Edge, PlannedSubTask};
pub use task::{
    AcceptanceCriteria, Artifact, ArtifactKind, Attempt, AttemptOutcome, Capability, FailureReason,
    Feedback, Provenance, SubTask, SubTaskId, SubTaskState, Verdict,
};
