//! Run identity and lifecycle.
//!
//! A run is one end-to-end execution of the supervisor for a single user
//! request. `RunState` enforces the run-level phase machine.

pub mod state;
pub mod types;

pub use state::{RunState, StatusHistoryEntry};
pub use types::{RunId, RunStatus};
