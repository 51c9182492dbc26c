//! Console rendering of engine events.

use std::io::Write;

use anyhow::{Context, Result};

use crate::core::types::StepReason;
use crate::events::{EngineEvent, Renderer};

/// Writes a human-readable transcript of the run.
///
/// With `raw_terminal` set (the keyboard listener has the terminal in raw
/// mode) every newline is written as `\r\n`.
pub struct ConsoleRenderer<W: Write + Send> {
    out: W,
    raw_terminal: bool,
    context_bucket: u8,
    mid_line: bool,
}

impl ConsoleRenderer<std::io::Stdout> {
    pub fn stdout(raw_terminal: bool) -> Self {
        Self::new(std::io::stdout(), raw_terminal)
    }
}

impl<W: Write + Send> ConsoleRenderer<W> {
    pub fn new(out: W, raw_terminal: bool) -> Self {
        Self {
            out,
            raw_terminal,
            context_bucket: 0,
            mid_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_raw(&mut self, text: &str) -> Result<()> {
        let text = if self.raw_terminal {
            text.replace("\r\n", "\n").replace('\n', "\r\n")
        } else {
            text.to_string()
        };
        self.out
            .write_all(text.as_bytes())
            .context("write console output")?;
        Ok(())
    }

    fn line(&mut self, text: &str) -> Result<()> {
        if self.mid_line {
            self.write_raw("\n")?;
            self.mid_line = false;
        }
        self.write_raw(text)?;
        self.write_raw("\n")
    }

    fn text(&mut self, text: &str) -> Result<()> {
        self.write_raw(text)?;
        self.mid_line = !text.ends_with('\n');
        Ok(())
    }
}

impl<W: Write + Send> Renderer for ConsoleRenderer<W> {
    fn render(&mut self, event: &EngineEvent) -> Result<()> {
        match event {
            EngineEvent::RunStarted {
                title,
                workflow,
                working_dir,
                progress,
                ..
            } => {
                self.line(&format!(
                    "planloop: {title} ({}/{} phases complete)",
                    progress.completed, progress.total
                ))?;
                self.line(&format!(
                    "  workflow: {workflow}\n  working dir: {}",
                    working_dir.display()
                ))?;
                self.line("  keys: p pause, c continue, m manual prompt, q stop")?;
            }
            EngineEvent::PhaseStarted {
                iteration,
                phase_number,
                phase_title,
                progress,
            } => {
                self.line("")?;
                self.line(&format!(
                    "== Phase {phase_number}: {phase_title} [iteration {}, {}%] ==",
                    iteration + 1,
                    progress.percent()
                ))?;
            }
            EngineEvent::StepStarted {
                step,
                kind,
                position,
                total,
                ..
            } => {
                self.line(&format!("-> [{position}/{total}] {step} ({})", kind.as_str()))?;
            }
            EngineEvent::TextDelta { text, .. } => self.text(text)?,
            EngineEvent::ToolCall { name, summary, .. } => match summary {
                Some(summary) => self.line(&format!("   * {name}: {summary}"))?,
                None => self.line(&format!("   * {name}"))?,
            },
            EngineEvent::ContextUpdate { percent, used, limit } => {
                let bucket = percent / 10;
                if bucket != self.context_bucket {
                    self.context_bucket = bucket;
                    self.line(&format!("   [context {percent}% ({used}/{limit} tokens)]"))?;
                }
            }
            EngineEvent::StepResult { result, .. } => {
                let seconds = result.duration_ms as f64 / 1000.0;
                let summary = match (&result.reason, result.failure) {
                    (StepReason::Completed, _) => format!("ok {} ({seconds:.1}s)", result.step),
                    (StepReason::StopPatternMatched { pattern }, _) => {
                        format!("ok {} (stop pattern `{pattern}`)", result.step)
                    }
                    (StepReason::SkippedClean, _) => {
                        format!("skipped {} (worktree clean)", result.step)
                    }
                    (StepReason::SkippedFirstPhaseOnly, _) => {
                        format!("skipped {} (first phase only)", result.step)
                    }
                    (StepReason::StopRequested, _) => format!("stopped {}", result.step),
                    (StepReason::Failed, Some(kind)) => {
                        format!("FAILED {} ({kind}): {}", result.step, first_line(&result.detail))
                    }
                    (StepReason::Failed, None) => format!("FAILED {}", result.step),
                };
                self.line(&format!("   {summary}"))?;
            }
            EngineEvent::PauseChanged { paused: true } => {
                self.line("[paused: press c to continue, m for a manual prompt, q to stop]")?;
            }
            EngineEvent::PauseChanged { paused: false } => self.line("[resumed]")?,
            EngineEvent::OverrideQueued { prompt } => {
                self.line(&format!("[manual prompt queued: {}]", first_line(prompt)))?;
            }
            EngineEvent::ChangedFiles { files } => {
                if files.is_empty() {
                    self.line("   no changes")?;
                }
                for file in files {
                    self.line(&format!("   {} {}", file.code, file.path))?;
                }
            }
            EngineEvent::Committed { message, pushed } => {
                let suffix = if *pushed { " and pushed" } else { "" };
                self.line(&format!("   committed `{message}`{suffix}"))?;
            }
            EngineEvent::Warning { message } => self.line(&format!("warning: {message}"))?,
            EngineEvent::PhaseFinished { progress, .. } => {
                self.line(&format!(
                    "   progress: {}/{} phases ({}%)",
                    progress.completed,
                    progress.total,
                    progress.percent()
                ))?;
            }
            EngineEvent::RunFinished {
                state,
                progress,
                detail,
            } => {
                let mut text = format!("run {state}");
                if let Some(progress) = progress {
                    text.push_str(&format!(
                        " ({}/{} phases, {}%)",
                        progress.completed,
                        progress.total,
                        progress.percent()
                    ));
                }
                if let Some(detail) = detail {
                    text.push_str(&format!(": {detail}"));
                }
                self.line(&text)?;
            }
        }
        self.out.flush().context("flush console output")?;
        Ok(())
    }
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default()
}
