//! Lifecycle event sinks and run snapshots.
//!
//! Events are the append-only audit trail of a run. Snapshots carry the
//! full task graph state and are what a run is resumed from.

pub mod events;
pub mod snapshot;

pub use events::{EventSink, FanoutSink, JsonlSink, LifecycleEvent, MemorySink, TracingSink};
pub use snapshot::{RunSnapshot, SnapshotStore, SNAPSHOT_VERSION};
