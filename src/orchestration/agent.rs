//! Agent handle contract.
//!
//! An `AgentHandle` is a capability-typed proxy through which the scheduler
//! submits one attempt of a sub-task to a specialist agent (researcher,
//! coder or writer) and receives its output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Artifact, ArtifactKind, Capability, Provenance, SubTaskId};
use crate::error::AgentError;
use crate::run::RunId;

/// Everything an agent needs to perform one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRequest {
    pub run_id: RunId,
    pub subtask: SubTaskId,
    /// 1-based attempt number within the sub-task.
    pub attempt: u32,
    /// Capability the attempt was routed to.
    pub capability: Capability,
    pub brief: String,
    pub params: BTreeMap<String, serde_json::Value>,
    /// Accepted artifacts of the sub-task's dependencies, in topological order.
    pub inputs: Vec<Arc<Artifact>>,
    /// Rendered critic feedback from the previous rejection.
    pub feedback: Option<String>,
}

/// Raw output of a successful attempt, before it becomes an `Artifact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub content: String,
    /// Content type tag. Defaults to the capability's kind when absent.
    #[serde(default)]
    pub kind: Option<ArtifactKind>,
}

impl AgentOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Seal the output into an immutable artifact.
    pub fn into_artifact(self, capability: Capability, provenance: Provenance) -> Artifact {
        let kind = self.kind.unwrap_or_else(|| capability.default_kind());
        Artifact::new(self.content, kind, provenance)
    }
}

/// A proxy to one specialist agent.
///
/// Implementations must honor `cancel`: once it fires, `dispatch` should
/// return promptly. Anything returned after cancellation is discarded.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// The capability this handle serves.
    fn capability(&self) -> Capability;

    /// Human-readable name used in logs.
    fn name(&self) -> String {
        self.capability().agent_name().to_string()
    }

    async fn dispatch(
        &self,
        request: AttemptRequest,
        cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError>;
}
