//! Retry and escalation policy.
//!
//! Given a rejected sub-task and its attempt history, the policy decides
//! whether to retry on the same capability, re-route once to an alternate
//! capability, or give up.

use std::collections::HashMap;
use std::time::Duration;

use crate::core::task::{Capability, SubTask, Verdict};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RetrySameAgent { delay: Duration },
    EscalateToDifferentCapability { to: Capability, delay: Duration },
    /// Mark the sub-task `Failed`.
    Abandon,
}

/// Decides the next step for a rejected sub-task.
///
/// Only consulted for rejections. The history on `subtask` already
/// includes the attempt that produced `verdict`.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, subtask: &SubTask, verdict: &Verdict) -> Action;
}

/// Bounded retries with exponential backoff and a single escalation.
///
/// Every sub-task gets `max_retries + 1` attempts in total. When an
/// alternate capability is viable, the original capability gets
/// `max_retries` of them and the last one is escalated. The alternate
/// comes from the sub-task's own `fallback`, else from the configured
/// escalation table.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    escalation: HashMap<Capability, Capability>,
}

impl DefaultRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            escalation: HashMap::new(),
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    pub fn with_escalation(mut self, from: Capability, to: Capability) -> Self {
        self.escalation.insert(from, to);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the next attempt: `base * 2^attempts`, capped at the max.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Alternate capability viable for `subtask`, if any.
    pub fn alternate_for(&self, subtask: &SubTask) -> Option<Capability> {
        subtask
            .fallback()
            .or_else(|| self.escalation.get(&subtask.capability()).copied())
            .filter(|alt| *alt != subtask.capability())
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, subtask: &SubTask, _verdict: &Verdict) -> Action {
        let attempts = subtask.attempts().len() as u32;
        if attempts > self.max_retries {
            return Action::Abandon;
        }

        let delay = self.backoff(attempts);
        match self.alternate_for(subtask) {
            Some(to)
                if !subtask.is_escalated()
                    && subtask.attempts_on(subtask.capability()) >= self.max_retries =>
            {
                Action::EscalateToDifferentCapability { to, delay }
            }
            _ => Action::RetrySameAgent { delay },
        }
    }
}
