//! Planner output: the decomposition a task graph is built from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::task::{AcceptanceCriteria, Capability, SubTaskId};

/// A directed dependency: `to` needs `from`'s artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: SubTaskId,
    pub to: SubTaskId,
}

/// One sub-task as declared by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedSubTask {
    pub id: SubTaskId,
    pub capability: Capability,
    /// Scoped instruction for the agent.
    pub brief: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Upstream sub-tasks whose artifacts are inputs. Each implies an edge.
    #[serde(default)]
    pub inputs: Vec<SubTaskId>,
    #[serde(default)]
    pub acceptance: AcceptanceCriteria,
    #[serde(default)]
    pub output_bearing: bool,
    /// Alternate capability viable for this sub-task when retries run out.
    #[serde(default)]
    pub fallback: Option<Capability>,
}

impl PlannedSubTask {
    pub fn new(id: &str, capability: Capability, brief: &str) -> Self {
        Self {
            id: SubTaskId::from(id),
            capability,
            brief: brief.to_string(),
            params: BTreeMap::new(),
            inputs: Vec::new(),
            acceptance: AcceptanceCriteria::default(),
            output_bearing: false,
            fallback: None,
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| SubTaskId::from(*s)).collect();
        self
    }

    pub fn with_acceptance(mut self, acceptance: AcceptanceCriteria) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn with_fallback(mut self, capability: Capability) -> Self {
        self.fallback = Some(capability);
        self
    }

    pub fn output(mut self) -> Self {
        self.output_bearing = true;
        self
    }
}

/// The planner's decomposition of a user request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    /// High-level interpretation of the request.
    #[serde(default)]
    pub goal: String,
    pub subtasks: Vec<PlannedSubTask>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Decomposition {
    pub fn new(goal: &str) -> Self {
        Self {
            goal: goal.to_string(),
            ..Default::default()
        }
    }

    pub fn with_subtask(mut self, subtask: PlannedSubTask) -> Self {
        self.subtasks.push(subtask);
        self
    }

    pub fn with_edge(mut self, from: &str, to: &str) -> Self {
        self.edges.push(Edge {
            from: SubTaskId::from(from),
            to: SubTaskId::from(to),
        });
        self
    }

    /// Parse a decomposition from TOML.
    pub fn from_toml(s: &str) -> crate::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parse a decomposition from JSON.
    pub fn from_json(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
