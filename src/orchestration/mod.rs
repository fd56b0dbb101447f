//! Orchestration layer for Briareus.
//!
//! The supervisor drives a run's task graph: the scheduler dispatches ready
//! sub-tasks to agent handles from the pool, critics judge the artifacts,
//! the retry policy decides what happens to rejections and the synthesizer
//! merges accepted work into the final output.

pub mod agent;
pub mod command;
pub mod critic;
pub mod planner;
pub mod policy;
pub mod pool;
pub mod scheduler;
pub mod supervisor;
pub mod synthesizer;

pub use agent::{AgentHandle, AgentOutput, AttemptRequest};
pub use command::CommandAgent;
pub use critic::{AcceptAll, Critic, CriticRegistry, RubricCritic};
pub use planner::{FilePlanner, Planner, StaticPlanner};
pub use policy::{Action, DefaultRetryPolicy, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use pool::{AgentPool, Lease};
pub use scheduler::{AttemptEvent, AttemptResult, Scheduler, DEFAULT_ATTEMPT_TIMEOUT};
pub use supervisor::{FailureRecord, RunReport, Supervisor};
pub use synthesizer::{
    ApplyDiffsInOrder, ConcatenateProse, FinalOutput, MergeStrategy, OutputSection, Synthesizer,
    SupportingNotes, SECTION_ORDER,
};
