//! Agent backend abstraction.
//!
//! The [`AgentBackend`] trait turns an [`AgentRequest`] into the command that
//! runs one agent invocation. The session driver owns spawning, streaming and
//! termination; backends only decide the argv. Tests use scripted backends
//! that replay canned `stream-json` output through `sh`.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Result, anyhow};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Rendered prompt (or the manual override that replaced it).
    pub prompt: String,
    /// `--allowedTools` list; empty means the agent's own default.
    pub allowed_tools: Vec<String>,
    /// Conversation to continue, if the session has one.
    pub resume_session: Option<String>,
    pub extra_args: Vec<String>,
}

/// Builds the process for one agent invocation.
pub trait AgentBackend {
    /// The command to spawn. Stdio is configured by the caller.
    fn command(&self, request: &AgentRequest) -> Result<Command>;
}

/// Backend for the `claude` CLI in print mode with `stream-json` output.
#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    binary: String,
}

impl ClaudeBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl AgentBackend for ClaudeBackend {
    fn command(&self, request: &AgentRequest) -> Result<Command> {
        if request.prompt.trim().is_empty() {
            return Err(anyhow!("agent prompt is empty"));
        }
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            // stream-json in print mode requires --verbose.
            .arg("--verbose");
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        if let Some(session) = &request.resume_session {
            cmd.arg("--resume").arg(session);
        }
        cmd.args(&request.extra_args).current_dir(&request.workdir);
        Ok(cmd)
    }
}
