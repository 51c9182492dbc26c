//! Test-only collaborators and fixtures.
//!
//! [`ScriptedAgent`] replays canned `stream-json` output through `sh`, so the
//! session driver runs a real child process. [`ScriptedVcs`] and
//! [`RecordingShell`] never spawn anything.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::core::types::ChangeEntry;
use crate::io::agent::{AgentBackend, AgentRequest};
use crate::io::git::VersionControl;
use crate::io::shell::{ShellOutput, ShellRequest, ShellRunner};

/// Plan text with one `## Phase N: Part N` block per status.
pub fn plan_text(statuses: &[&str]) -> String {
    let mut text = String::from("# Test Plan\n\n## Summary\nNothing done yet.\n\n");
    for (idx, status) in statuses.iter().enumerate() {
        let n = idx + 1;
        text.push_str(&format!(
            "## Phase {n}: Part {n}\n\n**Status:** {status}\n\n- Implement part {n}\n\n"
        ));
    }
    text
}

/// `stream-json` assistant message carrying `text` and a usage report.
pub fn assistant_line(text: &str, context_tokens: u64) -> String {
    json!({
        "type": "assistant",
        "message": {
            "content": [{"type": "text", "text": text}],
            "usage": {"input_tokens": context_tokens, "output_tokens": 0}
        }
    })
    .to_string()
}

/// `stream-json` final result with an optional structured confidence.
pub fn result_line(session_id: &str, confidence: Option<f64>) -> String {
    let mut value = json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": "done",
        "session_id": session_id,
    });
    if let Some(confidence) = confidence {
        value["structured_output"] = json!({ "confidence": confidence });
    }
    value.to_string()
}

/// One scripted agent invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// stdout lines, in order.
    pub lines: Vec<String>,
    pub exit_code: i32,
    /// Replace the plan document before the "agent" runs.
    pub plan_rewrite: Option<String>,
    /// Keep running after the output until killed.
    pub hang: bool,
}

impl ScriptedTurn {
    /// Some text, a usage report and a confident result.
    pub fn ok(text: &str) -> Self {
        Self {
            lines: vec![assistant_line(text, 1_000), result_line("sess-1", Some(0.9))],
            ..Self::default()
        }
    }

    pub fn rewriting_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan_rewrite = Some(plan.into());
        self
    }
}

/// Agent backend that plays [`ScriptedTurn`]s in order and records requests.
pub struct ScriptedAgent {
    plan_path: PathBuf,
    scratch: TempDir,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(plan_path: impl Into<PathBuf>, turns: Vec<ScriptedTurn>) -> Result<Self> {
        Ok(Self {
            plan_path: plan_path.into(),
            scratch: tempfile::tempdir().context("create scripted agent dir")?,
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or_default()
    }
}

impl AgentBackend for ScriptedAgent {
    fn command(&self, request: &AgentRequest) -> Result<Command> {
        let mut requests = self.requests.lock().map_err(|_| anyhow!("requests poisoned"))?;
        let turn_no = requests.len();
        requests.push(request.clone());
        let turn = self
            .turns
            .lock()
            .map_err(|_| anyhow!("turns poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted agent turn left"))?;

        if let Some(plan) = &turn.plan_rewrite {
            fs::write(&self.plan_path, plan)
                .with_context(|| format!("rewrite {}", self.plan_path.display()))?;
        }
        let out_path = self.scratch.path().join(format!("turn-{turn_no}.jsonl"));
        let mut body = turn.lines.join("\n");
        body.push('\n');
        fs::write(&out_path, body).context("write scripted output")?;

        let tail = if turn.hang {
            "sleep 30; true".to_string()
        } else {
            format!("exit {}", turn.exit_code)
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("cat '{}'; {tail}", out_path.display()));
        Ok(cmd)
    }
}

/// In-memory worktree: a list of changes that commits clear.
#[derive(Default)]
pub struct ScriptedVcs {
    changes: Mutex<Vec<ChangeEntry>>,
    commits: Mutex<Vec<String>>,
    pushes: Mutex<usize>,
}

impl ScriptedVcs {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn dirty(paths: &[&str]) -> Self {
        let vcs = Self::default();
        vcs.set_changes(paths);
        vcs
    }

    /// Replace the pending changes with modifications of `paths`.
    pub fn set_changes(&self, paths: &[&str]) {
        if let Ok(mut changes) = self.changes.lock() {
            *changes = paths
                .iter()
                .map(|p| ChangeEntry {
                    code: " M".to_string(),
                    path: (*p).to_string(),
                })
                .collect();
        }
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn pushes(&self) -> usize {
        self.pushes.lock().map(|p| *p).unwrap_or_default()
    }
}

impl VersionControl for ScriptedVcs {
    fn status(&self) -> Result<Vec<ChangeEntry>> {
        Ok(self
            .changes
            .lock()
            .map_err(|_| anyhow!("changes poisoned"))?
            .clone())
    }

    fn commit_all(&self, message: &str) -> Result<bool> {
        let mut changes = self.changes.lock().map_err(|_| anyhow!("changes poisoned"))?;
        if changes.is_empty() {
            return Ok(false);
        }
        changes.clear();
        self.commits
            .lock()
            .map_err(|_| anyhow!("commits poisoned"))?
            .push(message.to_string());
        Ok(true)
    }

    fn push(&self) -> Result<()> {
        *self.pushes.lock().map_err(|_| anyhow!("pushes poisoned"))? += 1;
        Ok(())
    }
}

/// Shell runner that records commands and fails the ones it is told to.
#[derive(Default)]
pub struct RecordingShell {
    failing: HashSet<String>,
    commands: Mutex<Vec<String>>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(commands: &[&str]) -> Self {
        Self {
            failing: commands.iter().map(|c| (*c).to_string()).collect(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ShellRunner for RecordingShell {
    fn run(&self, request: &ShellRequest) -> Result<ShellOutput> {
        self.commands
            .lock()
            .map_err(|_| anyhow!("commands poisoned"))?
            .push(request.command.clone());
        let fails = self.failing.contains(&request.command);
        Ok(ShellOutput {
            exit_code: Some(if fails { 1 } else { 0 }),
            success: !fails,
            timed_out: false,
            output: if fails { "scripted failure\n" } else { "" }.to_string(),
        })
    }
}

/// Temporary project directory holding a plan document.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create workspace dir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn plan_path(&self) -> PathBuf {
        self.dir.path().join("plan.md")
    }

    pub fn write_plan(&self, text: &str) -> Result<PathBuf> {
        let path = self.plan_path();
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_plan(&self) -> Result<String> {
        let path = self.plan_path();
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }
}
