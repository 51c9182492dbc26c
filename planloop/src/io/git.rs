//! Git collaborator for the engine.
//!
//! The engine only needs a handful of questions answered between steps, so the
//! surface is the [`VersionControl`] trait; [`Git`] implements it over the
//! `git` binary and tests substitute scripted implementations.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument, warn};

use crate::core::types::ChangeEntry;

/// Synchronous status/commit/push surface used between steps.
pub trait VersionControl {
    /// Changed and untracked files, as `git status --porcelain` reports them.
    fn status(&self) -> Result<Vec<ChangeEntry>>;

    /// True if the worktree has no changes, untracked files included.
    fn is_clean(&self) -> Result<bool> {
        Ok(self.status()?.is_empty())
    }

    /// Stage everything and commit. Returns false when there was nothing to commit.
    fn commit_all(&self, message: &str) -> Result<bool>;

    fn push(&self) -> Result<()>;
}

/// `git` invoked in a fixed working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Top-level directory of the repository containing `dir`, if any.
    pub fn toplevel(dir: &Path) -> Option<PathBuf> {
        let git = Self::new(dir);
        let top = git.stdout(&["rev-parse", "--show-toplevel"]).ok()?;
        let top = top.trim();
        (!top.is_empty()).then(|| PathBuf::from(top))
    }

    fn command(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    /// Run and require success; returns stdout.
    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args)?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VersionControl for Git {
    #[instrument(skip_all)]
    fn status(&self) -> Result<Vec<ChangeEntry>> {
        let porcelain = self.stdout(&["status", "--porcelain=v1", "-uall"])?;
        let entries = porcelain
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect::<Result<Vec<_>>>()?;
        debug!(changed = entries.len(), "worktree status");
        Ok(entries)
    }

    #[instrument(skip_all)]
    fn commit_all(&self, message: &str) -> Result<bool> {
        self.stdout(&["add", "-A"])?;
        // `diff --quiet` exits 1 when something is staged.
        let staged = self.command(&["diff", "--cached", "--quiet"])?;
        match staged.status.code() {
            Some(0) => {
                debug!("nothing staged");
                return Ok(false);
            }
            Some(1) => {}
            _ => bail!(
                "git diff --cached failed: {}",
                String::from_utf8_lossy(&staged.stderr).trim()
            ),
        }
        self.stdout(&["commit", "-q", "-m", message])?;
        debug!(message, "committed");
        Ok(true)
    }

    #[instrument(skip_all)]
    fn push(&self) -> Result<()> {
        self.stdout(&["push"]).map(drop).inspect_err(|err| {
            warn!(err = %err, "git push failed");
        })
    }
}

/// One `--porcelain=v1` line: `XY path`, or `XY old -> new` for renames.
fn parse_status_line(line: &str) -> Result<ChangeEntry> {
    let (Some(code), Some(rest)) = (line.get(..2), line.get(3..)) else {
        bail!("unexpected porcelain line: '{line}'");
    };
    let path = match rest.split_once(" -> ") {
        Some((_, renamed)) => renamed,
        None => rest,
    }
    .trim();
    if path.is_empty() {
        bail!("unexpected porcelain line: '{line}'");
    }
    Ok(ChangeEntry {
        code: code.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? notes/todo.md").expect("parse");
        assert_eq!(
            e,
            ChangeEntry {
                code: "??".to_string(),
                path: "notes/todo.md".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  PLAN.md -> docs/PLAN.md").expect("parse");
        assert_eq!(e.code, "R ");
        assert_eq!(e.path, "docs/PLAN.md");
    }

    #[test]
    fn rejects_truncated_line() {
        assert!(parse_status_line(" M").is_err());
        assert!(parse_status_line(" M ").is_err());
    }

    /// Verifies status/commit against a real repository.
    ///
    /// Skips silently when `git` is not installed.
    #[test]
    fn status_and_commit_in_temp_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        if git.stdout(&["init", "-q"]).is_err() {
            return;
        }
        git.stdout(&["config", "user.email", "planloop@example.com"])
            .expect("config email");
        git.stdout(&["config", "user.name", "planloop"])
            .expect("config name");

        assert!(git.is_clean().expect("clean"));
        std::fs::write(temp.path().join("a.txt"), "a").expect("write");
        let status = git.status().expect("status");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].code, "??");
        assert!(git.commit_all("feat: add a.txt").expect("commit"));
        assert!(git.is_clean().expect("clean after commit"));
        assert!(!git.commit_all("chore: nothing").expect("empty commit"));
        assert_eq!(
            Git::toplevel(temp.path()).map(|p| p.canonicalize().expect("canon")),
            Some(temp.path().canonicalize().expect("canon"))
        );
    }
}
