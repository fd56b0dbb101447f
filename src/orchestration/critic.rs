//! Critics judge returned artifacts against acceptance criteria.
//!
//! A critic is a pure function of the sub-task and the artifact: it never
//! touches the graph. Critics are pluggable per capability through the
//! [`CriticRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use regex::RegexBuilder;

use crate::core::task::{Artifact, Capability, Feedback, SubTask, Verdict};

pub trait Critic: Send + Sync {
    fn evaluate(&self, subtask: &SubTask, artifact: &Artifact) -> Verdict;
}

/// Accepts every artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Critic for AcceptAll {
    fn evaluate(&self, _subtask: &SubTask, _artifact: &Artifact) -> Verdict {
        Verdict::Accept
    }
}

/// Checks an artifact against the sub-task's [`AcceptanceCriteria`].
///
/// Rejects empty content, an unexpected artifact kind, content shorter than
/// `min_chars`, missing `must_include` terms (case-insensitive) and
/// `must_match` patterns that do not match. The feedback lists every issue
/// found, not just the first.
///
/// [`AcceptanceCriteria`]: crate::core::task::AcceptanceCriteria
#[derive(Debug, Clone, Copy, Default)]
pub struct RubricCritic;

impl RubricCritic {
    fn issues(subtask: &SubTask, artifact: &Artifact) -> Vec<String> {
        let criteria = subtask.acceptance();
        let content = artifact.content.trim();
        let mut issues = Vec::new();

        if content.is_empty() {
            issues.push("artifact is empty".to_string());
        }

        if let Some(expected) = &criteria.expected_kind {
            if &artifact.kind != expected {
                issues.push(format!("expected a {} artifact, got {}", expected, artifact.kind));
            }
        }

        if let Some(min) = criteria.min_chars {
            let len = content.chars().count();
            if len < min {
                issues.push(format!("too short: {} characters, need at least {}", len, min));
            }
        }

        let lowered = content.to_lowercase();
        for term in &criteria.must_include {
            if !lowered.contains(&term.to_lowercase()) {
                issues.push(format!("missing required term \"{}\"", term));
            }
        }

        for pattern in &criteria.must_match {
            match RegexBuilder::new(pattern).multi_line(true).build() {
                Ok(re) if re.is_match(content) => {}
                Ok(_) => issues.push(format!("does not match /{}/", pattern)),
                Err(err) => issues.push(format!("invalid pattern /{}/: {}", pattern, err)),
            }
        }

        issues
    }
}

impl Critic for RubricCritic {
    fn evaluate(&self, subtask: &SubTask, artifact: &Artifact) -> Verdict {
        let issues = Self::issues(subtask, artifact);
        if issues.is_empty() {
            return Verdict::Accept;
        }

        let description = &subtask.acceptance().description;
        let summary = if description.is_empty() {
            format!("{} issue(s) found", issues.len())
        } else {
            format!("does not satisfy: {}", description)
        };
        Verdict::Reject {
            feedback: Feedback::with_issues(summary, issues),
        }
    }
}

/// Capability-keyed critic strategies.
///
/// Lookup uses the capability the sub-task was planned for, so an escalated
/// sub-task is still judged by its own criteria and critic.
#[derive(Clone)]
pub struct CriticRegistry {
    critics: HashMap<Capability, Arc<dyn Critic>>,
    fallback: Arc<dyn Critic>,
}

impl CriticRegistry {
    /// A registry that applies [`RubricCritic`] to every capability.
    pub fn new() -> Self {
        Self::with_default(Arc::new(RubricCritic))
    }

    pub fn with_default(fallback: Arc<dyn Critic>) -> Self {
        Self {
            critics: HashMap::new(),
            fallback,
        }
    }

    pub fn register(mut self, capability: Capability, critic: Arc<dyn Critic>) -> Self {
        self.critics.insert(capability, critic);
        self
    }

    pub fn critic_for(&self, capability: Capability) -> &Arc<dyn Critic> {
        self.critics.get(&capability).unwrap_or(&self.fallback)
    }

    pub fn evaluate(&self, subtask: &SubTask, artifact: &Artifact) -> Verdict {
        self.critic_for(subtask.capability()).evaluate(subtask, artifact)
    }
}

impl Default for CriticRegistry {
    fn default() -> Self {
        Self::new()
    }
}
