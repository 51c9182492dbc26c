//! Rendering of the `{context}` variable for a phase.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::plan::{Phase, Plan};

const PHASE_CONTEXT_TEMPLATE: &str = include_str!("prompts/phase_context.md");

#[derive(Debug, Serialize)]
struct PlanContext<'a> {
    title: &'a str,
    summary: Option<&'a str>,
    completed: usize,
    total: usize,
}

/// Plain-text briefing for `phase`: plan title, progress summary, the
/// phase's steps and its success criteria.
pub fn render_phase_context(plan: &Plan, phase: &Phase) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("phase_context", PHASE_CONTEXT_TEMPLATE)
        .context("load phase context template")?;
    let progress = plan.progress();
    let plan_ctx = PlanContext {
        title: &plan.title,
        summary: plan.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        completed: progress.completed,
        total: progress.total,
    };
    let rendered = env
        .get_template("phase_context")?
        .render(context! { plan => plan_ctx, phase => phase })
        .context("render phase context")?;
    Ok(rendered.trim().to_string())
}
