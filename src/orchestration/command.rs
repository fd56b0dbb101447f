//! Process-backed agent handles.
//!
//! A `CommandAgent` runs a configured command once per attempt. The
//! attempt request is written to the child's stdin as JSON and whatever
//! the child prints on stdout becomes the artifact: either a JSON object
//! `{"content": ..., "kind": ...}` or plain text.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::task::Capability;
use crate::error::{AgentError, Error, Result};
use crate::orchestration::agent::{AgentHandle, AgentOutput, AttemptRequest};

/// Agent handle that shells out to an external program.
///
/// # Example
///
/// ```ignore
/// use briareus::orchestration::CommandAgent;
/// use briareus::core::Capability;
///
/// let agent = CommandAgent::new(Capability::Research, "python agents/researcher.py --json")?;
/// agent.check_available()?;
/// ```
#[derive(Debug, Clone)]
pub struct CommandAgent {
    capability: Capability,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandAgent {
    /// Create an agent from a command line. The command is split on
    /// whitespace; the first word is the program.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the command is empty.
    pub fn new(capability: Capability, command: &str) -> Result<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| Error::Validation(format!("empty command for {} agent", capability)))?;
        Ok(Self {
            capability,
            program,
            args: words.collect(),
            cwd: None,
        })
    }

    /// Run the command in `dir` instead of the current directory.
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Resolve the program on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the binary cannot be found.
    pub fn check_available(&self) -> Result<PathBuf> {
        which::which(&self.program).map_err(|_| {
            Error::Validation(format!(
                "{} agent binary not found: {}",
                self.capability, self.program
            ))
        })
    }

    /// Interpret the child's stdout.
    pub fn parse_output(stdout: &str) -> AgentOutput {
        let trimmed = stdout.trim();
        if trimmed.starts_with('{') {
            if let Ok(output) = serde_json::from_str::<AgentOutput>(trimmed) {
                return output;
            }
        }
        AgentOutput::new(stdout.trim_end())
    }
}

#[async_trait]
impl AgentHandle for CommandAgent {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn name(&self) -> String {
        format!("{}:{}", self.capability.agent_name(), self.program)
    }

    async fn dispatch(
        &self,
        request: AttemptRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<AgentOutput, AgentError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| AgentError::Failed(format!("could not encode request: {}", e)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Unavailable {
                    capability: self.capability,
                }
            } else {
                AgentError::Failed(format!("could not start {}: {}", self.program, e))
            }
        })?;
        debug!(
            subtask = %request.subtask,
            attempt = request.attempt,
            program = %self.program,
            "Agent process started"
        );

        // Feed the request while stdout drains; cancellation must not wait
        // on a child that never reads its input.
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // A child that never reads its input closes the pipe early.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Agent did not consume request");
                }
            })
        });

        // Dropping the child on cancellation kills it.
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            output = child.wait_with_output() => Some(output),
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let output = match finished {
            Some(output) => output
                .map_err(|e| AgentError::Failed(format!("{} failed: {}", self.program, e)))?,
            None => return Err(AgentError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.program,
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(AgentError::Failed(message));
        }

        Ok(Self::parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}
