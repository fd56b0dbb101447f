//! Run snapshots and the file store used by the resume path.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::dag::GraphSnapshot;
use crate::error::{Error, Result};
use crate::orchestration::FinalOutput;
use crate::run::{RunId, RunState};
use crate::state::events::{EventSink, LifecycleEvent};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to continue a run after a restart: every sub-task
/// state, the full attempt history with artifact provenance, the run
/// status history and the final output once there is one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u32,
    pub run: RunState,
    pub graph: GraphSnapshot,
    #[serde(default)]
    pub output: Option<FinalOutput>,
    pub saved_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(run: RunState, graph: GraphSnapshot, output: Option<FinalOutput>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            run,
            graph,
            output,
            saved_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run.id()
    }
}

/// Stores one JSON snapshot per run under a directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store at `~/.briareus/runs`.
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(Config::runs_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write the snapshot through a temp file so readers never see a
    /// partial document.
    pub fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "Creating snapshot directory");
            fs::create_dir_all(&self.dir)?;
        }
        let path = self.path_for(&snapshot.run_id());
        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(snapshot)?;
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &path)?;
        debug!(run_id = %snapshot.run_id(), path = %path.display(), "Snapshot saved");
        Ok(())
    }

    pub fn load(&self, id: &RunId) -> Result<RunSnapshot> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(Error::SnapshotNotFound(id.to_string()));
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Ids of every stored run, sorted.
    pub fn list(&self) -> Result<Vec<RunId>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }
}

impl EventSink for SnapshotStore {
    fn emit(&self, _event: &LifecycleEvent) {}

    fn checkpoint(&self, snapshot: &RunSnapshot) {
        if let Err(err) = self.save(snapshot) {
            warn!(run_id = %snapshot.run_id(), error = %err, "Failed to save snapshot");
        }
    }
}
