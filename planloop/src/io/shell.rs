//! Shell step execution.
//!
//! The [`ShellRunner`] trait decouples shell steps from process spawning.
//! Tests use recording runners that never start a process.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::run_bounded;

/// One shell command invocation.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub workdir: PathBuf,
    pub command: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    /// stdout then stderr, bounded.
    pub output: String,
}

pub trait ShellRunner {
    fn run(&self, request: &ShellRequest) -> Result<ShellOutput>;
}

/// Runs commands through `sh -c`.
pub struct SystemShell;

impl ShellRunner for SystemShell {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &ShellRequest) -> Result<ShellOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);
        let output = run_bounded(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run `{}`", request.command))?;

        let success = output.status.success() && !output.timed_out;
        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "shell command timed out"
            );
        } else if !success {
            warn!(exit_code = ?output.status.code(), "shell command failed");
        } else {
            debug!("shell command succeeded");
        }
        Ok(ShellOutput {
            exit_code: output.status.code(),
            success,
            timed_out: output.timed_out,
            output: output.transcript(),
        })
    }
}

/// Remove commands that push, for runs with pushing disabled.
pub fn without_push(commands: Vec<String>) -> Vec<String> {
    commands.into_iter().filter(|cmd| !runs_git_push(cmd)).collect()
}

/// True if any simple command in `command` is `git [options] push`.
fn runs_git_push(command: &str) -> bool {
    command.split(['\n', ';', '&', '|']).any(|segment| {
        let mut words = segment
            .split_whitespace()
            .skip_while(|word| !word.starts_with('-') && word.contains('='));
        if words.next() != Some("git") {
            return false;
        }
        while let Some(word) = words.next() {
            match word {
                // Options that take a separate value.
                "-C" | "-c" | "--git-dir" | "--work-tree" => {
                    words.next();
                }
                option if option.starts_with('-') => {}
                subcommand => return subcommand == "push",
            }
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_commands_are_filtered() {
        let commands = vec![
            "git add -A".to_string(),
            "git commit -m 'x'".to_string(),
            "git push origin main".to_string(),
        ];
        assert_eq!(
            without_push(commands),
            vec!["git add -A".to_string(), "git commit -m 'x'".to_string()]
        );
    }

    #[test]
    fn push_detection_matches_command_words() {
        assert!(runs_git_push("git push"));
        assert!(runs_git_push("cargo test && git push origin HEAD"));
        assert!(runs_git_push("git -C repo push --tags"));
        assert!(runs_git_push("GIT_TRACE=1 git push"));
        assert!(!runs_git_push("echo \"remember to git push\""));
        assert!(!runs_git_push("git commit -m 'push later'"));
        assert!(!runs_git_push("git stash push"));
    }

    #[cfg(unix)]
    #[test]
    fn system_shell_runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "here").expect("write");
        let output = SystemShell
            .run(&ShellRequest {
                workdir: temp.path().to_path_buf(),
                command: "cat marker.txt && exit 4".to_string(),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1_000,
            })
            .expect("run");
        assert_eq!(output.exit_code, Some(4));
        assert!(!output.success);
        assert!(output.output.contains("here"));
    }
}
