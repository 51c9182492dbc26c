//! Project configuration stored under `.planloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Project directory holding config, workflow overrides and run logs.
pub const PROJECT_DIR: &str = ".planloop";
pub const CONFIG_FILE: &str = "config.toml";

/// Runner configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below. CLI flags
/// override individual values for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Agent steps reporting a lower confidence fail with `LowConfidence`.
    pub confidence_threshold: f64,

    /// Context window size used for the context meter.
    pub context_limit: u64,

    /// Safety cap on phase iterations per run.
    pub max_iterations: usize,

    /// How long a stopped agent gets to exit before it is killed.
    pub stop_grace_secs: u64,

    /// Capacity of the merged agent-output/control queue.
    pub queue_capacity: usize,

    /// Capacity of the engine → renderer event channel.
    pub event_buffer: usize,

    /// Per-command timeout for shell steps.
    pub shell_timeout_secs: u64,

    /// Truncate shell step output beyond this many bytes.
    pub shell_output_limit_bytes: usize,

    /// Commit leftover changes after every phase.
    pub auto_commit: bool,

    /// Push after commits; when false, `git push` commands are dropped from shell steps.
    pub auto_push: bool,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub binary: String,

    /// Default `--allowedTools` for agent steps that do not set their own.
    pub allowed_tools: Vec<String>,

    /// Extra arguments appended to every agent invocation.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            context_limit: 200_000,
            max_iterations: 50,
            stop_grace_secs: 5,
            queue_capacity: 256,
            event_buffer: 512,
            shell_timeout_secs: 30 * 60,
            shell_output_limit_bytes: 100_000,
            auto_commit: false,
            auto_push: true,
            agent: AgentConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0.0..=1.0"));
        }
        if self.context_limit == 0 {
            return Err(anyhow!("context_limit must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be > 0"));
        }
        if self.shell_timeout_secs == 0 {
            return Err(anyhow!("shell_timeout_secs must be > 0"));
        }
        if self.shell_output_limit_bytes == 0 {
            return Err(anyhow!("shell_output_limit_bytes must be > 0"));
        }
        if self.agent.binary.trim().is_empty() {
            return Err(anyhow!("agent.binary must not be empty"));
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }
}

/// `<working_dir>/.planloop`
pub fn project_dir(working_dir: &Path) -> PathBuf {
    working_dir.join(PROJECT_DIR)
}

/// `<working_dir>/.planloop/config.toml`
pub fn config_path(working_dir: &Path) -> PathBuf {
    project_dir(working_dir).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Write `contents` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
