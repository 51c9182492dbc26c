//! Text output for `planloop preview` and `planloop run --dry-run`.

use std::fmt::Write;

use crate::core::plan::{Phase, PhaseStatus, Plan};
use crate::core::workflow::StepKind;
use crate::engine::PlannedStep;

const BAR_WIDTH: usize = 20;
/// Prompt lines shown per agent step in a dry run.
const PROMPT_PREVIEW_LINES: usize = 6;

/// Phase breakdown of `plan`, marking the phase a run would start with.
pub fn render_plan(plan: &Plan) -> String {
    let progress = plan.progress();
    let current = plan.next_incomplete_phase().map(|p| p.index);
    let mut out = String::new();
    let _ = writeln!(out, "Title: {}", plan.title);
    let _ = writeln!(out, "Path: {}", plan.path.display());
    let _ = writeln!(
        out,
        "Progress: {} {}/{} phases ({}%)",
        progress_bar(progress.completed, progress.total),
        progress.completed,
        progress.total,
        progress.percent()
    );
    if let Some(summary) = &plan.summary {
        let _ = writeln!(out, "\nSummary:");
        for line in summary.lines() {
            let _ = writeln!(out, "  {line}");
        }
    }

    let _ = writeln!(out, "\nPhases:");
    for phase in &plan.phases {
        let marker = if Some(phase.index) == current {
            " (current)"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "  {} Phase {}: {}{marker}",
            status_icon(phase.status),
            phase.number,
            phase.title
        );
        if !phase.steps.is_empty() || !phase.success_criteria.is_empty() {
            let _ = writeln!(
                out,
                "      {} steps, {} success criteria",
                phase.steps.len(),
                phase.success_criteria.len()
            );
        }
    }

    match plan.next_incomplete_phase() {
        Some(phase) => out.push_str(&render_phase_detail(phase)),
        None => out.push_str("\nAll phases complete.\n"),
    }
    out
}

fn render_phase_detail(phase: &Phase) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\nNext: Phase {}: {}", phase.number, phase.title);
    for step in &phase.steps {
        let manual = if step.manual_check { " [manual]" } else { "" };
        let _ = writeln!(out, "  - {}{manual}", step.text);
    }
    if !phase.success_criteria.is_empty() {
        let _ = writeln!(out, "  Success criteria:");
        for criterion in &phase.success_criteria {
            let _ = writeln!(out, "  - {criterion}");
        }
    }
    out
}

/// What a run would execute for `phase`.
pub fn render_dry_run(phase: &Phase, steps: &[PlannedStep]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Dry run for Phase {}: {} ({} steps)",
        phase.number,
        phase.title,
        steps.len()
    );
    for (idx, step) in steps.iter().enumerate() {
        let _ = writeln!(out, "\n{}. {} [{}]", idx + 1, step.name, step.kind.as_str());
        if !step.notes.is_empty() {
            let _ = writeln!(out, "   ({})", step.notes.join("; "));
        }
        match step.kind {
            StepKind::Shell => {
                if step.lines.is_empty() {
                    let _ = writeln!(out, "   (no commands after filtering)");
                }
                for command in &step.lines {
                    let _ = writeln!(out, "   $ {command}");
                }
            }
            StepKind::Agent => {
                let prompt = step.lines.join("\n");
                let lines: Vec<&str> = prompt.trim().lines().collect();
                for line in lines.iter().take(PROMPT_PREVIEW_LINES) {
                    let _ = writeln!(out, "   | {line}");
                }
                if lines.len() > PROMPT_PREVIEW_LINES {
                    let _ = writeln!(
                        out,
                        "   | ... ({} more lines)",
                        lines.len() - PROMPT_PREVIEW_LINES
                    );
                }
            }
            StepKind::Internal => {
                for action in &step.lines {
                    let _ = writeln!(out, "   action: {action}");
                }
            }
        }
    }
    out
}

fn status_icon(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Complete => "[x]",
        PhaseStatus::InProgress => "[~]",
        PhaseStatus::Pending => "[ ]",
    }
}

fn progress_bar(completed: usize, total: usize) -> String {
    let filled = if total == 0 {
        0
    } else {
        (completed * BAR_WIDTH) / total
    };
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}
