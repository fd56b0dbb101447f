//! Planners turn a user request into a decomposition.
//!
//! Producing the plan is outside the orchestration core; the supervisor
//! only validates what a planner returns. Two planners ship with the
//! crate: a fixed decomposition and one read from a JSON or TOML file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::core::plan::Decomposition;
use crate::error::Result;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str) -> Result<Decomposition>;
}

/// Returns the same decomposition for every request.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    decomposition: Decomposition,
}

impl StaticPlanner {
    pub fn new(decomposition: Decomposition) -> Self {
        Self { decomposition }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, request: &str) -> Result<Decomposition> {
        Ok(with_goal(self.decomposition.clone(), request))
    }
}

/// Reads the decomposition from a file: TOML when the extension is
/// `.toml`, JSON otherwise.
#[derive(Debug, Clone)]
pub struct FilePlanner {
    path: PathBuf,
}

impl FilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file without a request.
    pub async fn load(&self) -> Result<Decomposition> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let is_toml = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        debug!(path = %self.path.display(), toml = is_toml, "Loading plan file");
        if is_toml {
            Decomposition::from_toml(&contents)
        } else {
            Decomposition::from_json(&contents)
        }
    }
}

#[async_trait]
impl Planner for FilePlanner {
    async fn plan(&self, request: &str) -> Result<Decomposition> {
        Ok(with_goal(self.load().await?, request))
    }
}

/// A plan without a stated goal takes the request as its goal.
fn with_goal(mut decomposition: Decomposition, request: &str) -> Decomposition {
    if decomposition.goal.trim().is_empty() {
        decomposition.goal = request.to_string();
    }
    decomposition
}
