use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::task::Capability;
use crate::{Error, Result};

/// Optional per-capability concurrency limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub research: Option<usize>,
    pub code: Option<usize>,
    pub write: Option<usize>,
}

impl Limits {
    pub fn for_capability(&self, capability: Capability) -> Option<usize> {
        match capability {
            Capability::Research => self.research,
            Capability::Code => self.code,
            Capability::Write => self.write,
        }
    }
}

/// An alternate capability allowed to take over a sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub from: Capability,
    pub to: Capability,
}

/// A process-backed agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub capability: Capability,
    pub command: String,
    #[serde(default = "default_instances")]
    pub instances: usize,
}

fn default_instances() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
    /// Global limit on attempts in flight.
    pub max_parallel: usize,
    pub max_plan_steps: usize,
    /// Run-wide attempt budget. Unset means unlimited.
    pub max_total_attempts: Option<u32>,
    pub limits: Limits,
    pub escalation: Vec<EscalationRule>,
    pub agents: Vec<AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            attempt_timeout_secs: 300,
            max_parallel: 4,
            max_plan_steps: 6,
            max_total_attempts: None,
            limits: Limits::default(),
            escalation: Vec::new(),
            agents: Vec::new(),
        }
    }
}

impl Config {
    pub fn briareus_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".briareus"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::briareus_dir()?.join("briareus.toml"))
    }

    pub fn runs_dir() -> Result<PathBuf> {
        Ok(Self::briareus_dir()?.join("runs"))
    }

    pub fn events_path() -> Result<PathBuf> {
        Ok(Self::briareus_dir()?.join("events.jsonl"))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Configured alternate for `capability`, if any.
    pub fn escalation_for(&self, capability: Capability) -> Option<Capability> {
        self.escalation
            .iter()
            .find(|rule| rule.from == capability)
            .map(|rule| rule.to)
    }

    /// Load `~/.briareus/briareus.toml`, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file without env overrides. A missing file gives defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            max_retries = config.max_retries,
            max_parallel = config.max_parallel,
            agents = config.agents.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::briareus_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "Creating briareus directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Apply `BRIAREUS_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "BRIAREUS_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parse_env(&lookup, "BRIAREUS_MAX_ATTEMPTS")? {
            self.max_total_attempts = Some(v);
        }
        if let Some(v) = parse_env(&lookup, "BRIAREUS_MAX_PLAN_STEPS")? {
            self.max_plan_steps = v;
        }
        if let Some(v) = parse_env(&lookup, "BRIAREUS_ATTEMPT_TIMEOUT_SECS")? {
            self.attempt_timeout_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".into()));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(Error::Validation("attempt_timeout_secs must be at least 1".into()));
        }
        if self.max_plan_steps == 0 {
            return Err(Error::Validation("max_plan_steps must be at least 1".into()));
        }
        if self.max_total_attempts == Some(0) {
            return Err(Error::Validation("max_total_attempts must be at least 1".into()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(Error::Validation(
                "base_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        for capability in Capability::ALL {
            if self.limits.for_capability(capability) == Some(0) {
                return Err(Error::Validation(format!(
                    "limit for {} must be at least 1",
                    capability
                )));
            }
        }
        for rule in &self.escalation {
            if rule.from == rule.to {
                return Err(Error::Validation(format!(
                    "escalation from {} to itself",
                    rule.from
                )));
            }
        }
        for agent in &self.agents {
            if agent.instances == 0 || agent.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "agent for {} needs a command and at least one instance",
                    agent.capability
                )));
            }
        }
        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Validation(format!("{} is not a valid number: {}", key, raw))),
    }
}
