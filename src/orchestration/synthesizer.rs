//! Synthesis of accepted artifacts into the final output.
//!
//! Accepted, output-bearing artifacts are grouped by capability: research
//! notes first as supporting material, then code, then prose. Within a group
//! sections follow the graph's topological order. Completion timing never
//! affects the result.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::dag::TaskGraph;
use crate::core::task::{ArtifactKind, Capability, SubTaskId};
use crate::error::SynthesisError;
use crate::run::RunId;

/// Group order in the final output.
pub const SECTION_ORDER: [Capability; 3] =
    [Capability::Research, Capability::Code, Capability::Write];

/// One accepted artifact as it appears in the final output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSection {
    pub subtask: SubTaskId,
    pub capability: Capability,
    pub kind: ArtifactKind,
    /// Attempt that produced the artifact.
    pub attempt: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub run_id: RunId,
    pub body: String,
    pub sections: Vec<OutputSection>,
}

/// Renders the sections of one capability group.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, sections: &[&OutputSection]) -> String;
}

/// Prose sections concatenated in order, each under its sub-task heading.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatenateProse;

impl MergeStrategy for ConcatenateProse {
    fn merge(&self, sections: &[&OutputSection]) -> String {
        sections
            .iter()
            .map(|s| format!("## {}\n\n{}", s.subtask, s.content.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Code diffs in dependency order, each newline-terminated so they can be
/// applied one after another.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyDiffsInOrder;

impl MergeStrategy for ApplyDiffsInOrder {
    fn merge(&self, sections: &[&OutputSection]) -> String {
        sections
            .iter()
            .map(|s| {
                let mut diff = s.content.trim_end().to_string();
                diff.push('\n');
                format!("## {}\n\n```diff\n{}```", s.subtask, diff)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Research notes rendered as supporting material.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportingNotes;

impl MergeStrategy for SupportingNotes {
    fn merge(&self, sections: &[&OutputSection]) -> String {
        sections
            .iter()
            .map(|s| format!("## {} (supporting)\n\n{}", s.subtask, s.content.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Clone)]
pub struct Synthesizer {
    strategies: HashMap<Capability, Arc<dyn MergeStrategy>>,
}

impl Synthesizer {
    pub fn new() -> Self {
        let mut strategies: HashMap<Capability, Arc<dyn MergeStrategy>> = HashMap::new();
        strategies.insert(Capability::Research, Arc::new(SupportingNotes));
        strategies.insert(Capability::Code, Arc::new(ApplyDiffsInOrder));
        strategies.insert(Capability::Write, Arc::new(ConcatenateProse));
        Self { strategies }
    }

    pub fn with_strategy(mut self, capability: Capability, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.strategies.insert(capability, strategy);
        self
    }

    /// Collect the accepted output-bearing artifacts in output order.
    pub fn sections(&self, graph: &TaskGraph) -> Vec<OutputSection> {
        let accepted: Vec<OutputSection> = graph
            .topological_order()
            .into_iter()
            .filter(|task| task.is_output_bearing())
            .filter_map(|task| {
                let artifact = task.accepted_artifact()?;
                Some(OutputSection {
                    subtask: task.id().clone(),
                    capability: task.capability(),
                    kind: artifact.kind.clone(),
                    attempt: artifact.provenance.attempt,
                    content: artifact.content.clone(),
                })
            })
            .collect();

        SECTION_ORDER
            .iter()
            .flat_map(|cap| accepted.iter().filter(move |s| s.capability == *cap))
            .cloned()
            .collect()
    }

    /// Merge the accepted output-bearing artifacts of `graph`.
    ///
    /// # Errors
    /// `InsufficientArtifacts` when no output-bearing sub-task was accepted.
    pub fn synthesize(&self, run_id: RunId, graph: &TaskGraph) -> Result<FinalOutput, SynthesisError> {
        let sections = self.sections(graph);
        if sections.is_empty() {
            return Err(SynthesisError::InsufficientArtifacts);
        }

        let mut parts = Vec::new();
        for capability in SECTION_ORDER {
            let group: Vec<&OutputSection> =
                sections.iter().filter(|s| s.capability == capability).collect();
            if group.is_empty() {
                continue;
            }
            let rendered = match self.strategies.get(&capability) {
                Some(strategy) => strategy.merge(&group),
                None => ConcatenateProse.merge(&group),
            };
            parts.push(rendered);
        }

        let mut body = parts.join("\n\n");
        body.push('\n');

        Ok(FinalOutput {
            run_id,
            body,
            sections,
        })
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new()
    }
}
