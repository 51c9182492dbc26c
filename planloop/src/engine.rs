//! The phase/step state machine.
//!
//! One [`WorkflowEngine`] drives one run: it reads the plan, picks the next
//! incomplete phase, runs every workflow step against it, re-reads the plan
//! and repeats until no incomplete phase remains, a required step fails, or a
//! `Stop` arrives.
//!
//! Control signals are only looked at in two places: before each step (all
//! signals, see [`WorkflowEngine::checkpoint`]) and inside the session driver
//! at every agent output read (`Stop` only).

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::control::{ControlSignal, Controller, Mailbox};
use crate::core::commit::commit_message;
use crate::core::plan::{Phase, Plan, Progress};
use crate::core::session::SessionState;
use crate::core::template::{RunContext, references, render};
use crate::core::types::{ExecutionResult, RunOutcome, RunState, StepReason};
use crate::core::workflow::{InternalAction, Step, StepAction, StepKind, Workflow};
use crate::error::{EngineError, FailureKind, TemplateError};
use crate::events::{EngineEvent, EventLog, EventStats};
use crate::io::agent::{AgentBackend, AgentRequest};
use crate::io::config::RunnerConfig;
use crate::io::git::VersionControl;
use crate::io::plan_store::load_plan;
use crate::io::prompt::render_phase_context;
use crate::io::shell::{ShellRequest, ShellRunner, without_push};
use crate::session_driver::{AgentInvocation, SessionDriver};

/// Variables every run context provides.
pub const BUILTIN_VARIABLES: [&str; 8] = [
    "plan_path",
    "working_dir",
    "plan_directory",
    "phase_number",
    "phase_title",
    "research_topic",
    "context",
    "commit_message",
];

/// Value of `{commit_message}` outside a real run.
const COMMIT_MESSAGE_PLACEHOLDER: &str = "<generated from worktree changes>";

/// External collaborators of a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub backend: &'a dyn AgentBackend,
    pub vcs: &'a dyn VersionControl,
    pub shell: &'a dyn ShellRunner,
}

enum PhaseEnd {
    Finished,
    Stopped,
}

enum Checkpoint {
    Proceed,
    Stop,
}

pub struct WorkflowEngine<'a> {
    plan_path: PathBuf,
    working_dir: PathBuf,
    workflow: Workflow,
    config: RunnerConfig,
    collaborators: Collaborators<'a>,
    mailbox: Mailbox,
    events: EventLog,
    session: SessionState,
    state: RunState,
    progress: Option<Progress>,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(
        plan_path: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        workflow: Workflow,
        config: RunnerConfig,
        collaborators: Collaborators<'a>,
        events: EventLog,
    ) -> Self {
        let session = SessionState::new(config.context_limit);
        let mailbox = Mailbox::new(config.queue_capacity);
        Self {
            plan_path: plan_path.into(),
            working_dir: working_dir.into(),
            workflow,
            config,
            collaborators,
            mailbox,
            events,
            session,
            state: RunState::Idle,
            progress: None,
        }
    }

    /// Handle for control producers (keyboard listener, Ctrl-C handler, tests).
    pub fn controller(&self) -> Controller {
        self.mailbox.controller()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Close the event log, waiting for renderers to drain it.
    pub fn finish(self) -> EventStats {
        self.events.close()
    }

    /// Run until the plan is complete, a required step fails, or a stop is
    /// requested.
    #[instrument(skip_all, fields(plan = %self.plan_path.display(), workflow = %self.workflow.name()))]
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        let result = self.run_phases();
        let (state, detail) = match &result {
            Ok(RunOutcome::Completed { .. }) => (RunState::Completed, None),
            Ok(RunOutcome::Stopped { .. }) => (RunState::Stopped, None),
            Err(err) => (RunState::Failed, Some(err.to_string())),
        };
        match &result {
            Ok(outcome) => info!(?outcome, "run finished"),
            Err(err) => warn!(err = %err, "run failed"),
        }
        let label = match state {
            RunState::Completed => "completed",
            RunState::Stopped => "stopped",
            _ => "failed",
        };
        self.state = state;
        self.events.emit(EngineEvent::RunFinished {
            state: label.to_string(),
            progress: self.progress,
            detail,
        });
        result
    }

    fn run_phases(&mut self) -> Result<RunOutcome, EngineError> {
        let mut plan = load_plan(&self.plan_path)?;
        check_template_tokens(&self.workflow)?;
        self.progress = Some(plan.progress());
        self.events.emit(EngineEvent::RunStarted {
            plan: self.plan_path.clone(),
            title: plan.title.clone(),
            workflow: self.workflow.name().to_string(),
            working_dir: self.working_dir.clone(),
            progress: plan.progress(),
        });

        let mut iteration = 0;
        loop {
            let Some(phase) = plan.next_incomplete_phase().cloned() else {
                return Ok(RunOutcome::Completed {
                    progress: plan.progress(),
                    iterations: iteration,
                });
            };
            if iteration >= self.config.max_iterations {
                return Err(EngineError::IterationLimit(iteration));
            }
            self.state = RunState::PhaseLoop { iteration };
            self.events.emit(EngineEvent::PhaseStarted {
                iteration,
                phase_number: phase.number,
                phase_title: phase.title.clone(),
                progress: plan.progress(),
            });

            let ctx = self.phase_context(&plan, &phase)?;
            if let PhaseEnd::Stopped = self.run_phase(iteration, ctx)? {
                return Ok(RunOutcome::Stopped {
                    progress: plan.progress(),
                    iterations: iteration + 1,
                });
            }
            if self.config.auto_commit {
                self.auto_commit();
            }

            plan = load_plan(&self.plan_path)?;
            self.progress = Some(plan.progress());
            self.events.emit(EngineEvent::PhaseFinished {
                iteration,
                progress: plan.progress(),
            });
            iteration += 1;
        }
    }

    fn phase_context(&self, plan: &Plan, phase: &Phase) -> Result<RunContext, EngineError> {
        let mut ctx = base_context(plan, phase, &self.working_dir, self.workflow.variables());
        ctx.set("context", render_phase_context(plan, phase)?);
        Ok(ctx)
    }

    #[instrument(skip_all, fields(iteration = iteration))]
    fn run_phase(&mut self, iteration: usize, mut ctx: RunContext) -> Result<PhaseEnd, EngineError> {
        let steps = self.workflow.steps.clone();
        let total = steps.len();
        for (idx, step) in steps.iter().enumerate() {
            if let Checkpoint::Stop = self.checkpoint(iteration, idx) {
                return Ok(PhaseEnd::Stopped);
            }
            self.state = RunState::StepLoop {
                iteration,
                step: idx,
            };
            self.events.emit(EngineEvent::StepStarted {
                iteration,
                step: step.name.clone(),
                kind: step.kind(),
                position: idx + 1,
                total,
            });

            let result = self.execute_step(step, iteration, &mut ctx)?;
            debug!(step = %step.name, success = result.success, reason = ?result.reason, "step finished");
            self.events.emit(EngineEvent::StepResult {
                iteration,
                result: result.clone(),
            });

            if result.is_stop_requested() {
                return Ok(PhaseEnd::Stopped);
            }
            if !result.success {
                let kind = result.failure.unwrap_or(FailureKind::ProcessError);
                if step.require_success {
                    return Err(EngineError::StepFailure {
                        step: step.name.clone(),
                        kind,
                        detail: result.detail,
                    });
                }
                warn!(step = %step.name, %kind, "step failed, continuing");
            }
        }
        Ok(PhaseEnd::Finished)
    }

    /// Step-boundary suspension point. Applies every pending control signal
    /// and blocks while paused.
    fn checkpoint(&mut self, iteration: usize, step: usize) -> Checkpoint {
        for signal in self.mailbox.drain_controls() {
            if let Checkpoint::Stop = self.apply_signal(signal) {
                return Checkpoint::Stop;
            }
        }
        while self.session.paused {
            self.state = RunState::Paused { iteration, step };
            let signal = self.mailbox.wait_control();
            if let Checkpoint::Stop = self.apply_signal(signal) {
                return Checkpoint::Stop;
            }
        }
        Checkpoint::Proceed
    }

    fn apply_signal(&mut self, signal: ControlSignal) -> Checkpoint {
        match signal {
            ControlSignal::Stop => {
                info!("stop requested");
                return Checkpoint::Stop;
            }
            ControlSignal::Pause => {
                if !self.session.paused {
                    self.session.paused = true;
                    self.events.emit(EngineEvent::PauseChanged { paused: true });
                }
            }
            ControlSignal::Resume => {
                if self.session.paused {
                    self.session.paused = false;
                    self.events.emit(EngineEvent::PauseChanged { paused: false });
                }
            }
            ControlSignal::ManualOverride(prompt) => {
                debug!(len = prompt.len(), "manual override queued");
                self.session.queue_override(prompt.clone());
                self.events.emit(EngineEvent::OverrideQueued { prompt });
            }
        }
        Checkpoint::Proceed
    }

    fn execute_step(
        &mut self,
        step: &Step,
        iteration: usize,
        ctx: &mut RunContext,
    ) -> Result<ExecutionResult, TemplateError> {
        if step.first_phase_only && iteration > 0 {
            return Ok(ExecutionResult::skipped(
                &step.name,
                StepReason::SkippedFirstPhaseOnly,
            ));
        }
        if step.templates().iter().any(|t| references(t, "commit_message")) {
            ctx.set("commit_message", self.current_commit_message());
        }

        let started = Instant::now();
        let result = match &step.action {
            StepAction::Agent {
                prompt,
                stop_on,
                allowed_tools,
            } => {
                let rendered = render(&step.name, prompt, ctx)?;
                let prompt = match self.session.take_override() {
                    Some(manual) => {
                        info!(step = %step.name, "using manual override prompt");
                        manual
                    }
                    None => rendered,
                };
                let invocation = AgentInvocation {
                    step: step.name.clone(),
                    request: AgentRequest {
                        workdir: self.working_dir.clone(),
                        prompt,
                        allowed_tools: allowed_tools
                            .clone()
                            .unwrap_or_else(|| self.config.agent.allowed_tools.clone()),
                        resume_session: self.session.session_id().map(str::to_string),
                        extra_args: self.config.agent.extra_args.clone(),
                    },
                    stop_on: stop_on.clone(),
                    stream: step.stream,
                };
                SessionDriver {
                    backend: self.collaborators.backend,
                    mailbox: &mut self.mailbox,
                    session: &mut self.session,
                    events: &mut self.events,
                    confidence_threshold: self.config.confidence_threshold,
                    stop_grace: self.config.stop_grace(),
                }
                .run(&invocation)
            }
            StepAction::Shell {
                commands,
                skip_if_clean,
            } => {
                let rendered = commands
                    .iter()
                    .map(|command| render(&step.name, command, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                if *skip_if_clean && self.worktree_clean() {
                    return Ok(ExecutionResult::skipped(&step.name, StepReason::SkippedClean));
                }
                self.run_shell(&step.name, rendered, started)
            }
            StepAction::Internal(action) => self.run_internal(&step.name, *action, started),
        };
        Ok(result)
    }

    fn run_shell(&self, step: &str, commands: Vec<String>, started: Instant) -> ExecutionResult {
        let commands = if self.config.auto_push {
            commands
        } else {
            without_push(commands)
        };
        let mut transcript = String::new();
        for command in commands {
            let request = ShellRequest {
                workdir: self.working_dir.clone(),
                command: command.clone(),
                timeout: self.config.shell_timeout(),
                output_limit_bytes: self.config.shell_output_limit_bytes,
            };
            let output = match self.collaborators.shell.run(&request) {
                Ok(output) => output,
                Err(err) => {
                    return ExecutionResult::failed(
                        step,
                        FailureKind::ProcessError,
                        format!("{err:#}"),
                        started.elapsed(),
                    );
                }
            };
            transcript.push_str(&format!("$ {command}\n{}", output.output));
            if !output.success {
                let cause = if output.timed_out {
                    "timed out".to_string()
                } else {
                    match output.exit_code {
                        Some(code) => format!("exited with code {code}"),
                        None => "was terminated by a signal".to_string(),
                    }
                };
                return ExecutionResult::failed(
                    step,
                    FailureKind::ProcessError,
                    format!("`{command}` {cause}\n{}", output.output.trim_end()),
                    started.elapsed(),
                );
            }
        }
        ExecutionResult::succeeded(step, StepReason::Completed, started.elapsed())
            .with_detail(transcript)
    }

    fn run_internal(&mut self, step: &str, action: InternalAction, started: Instant) -> ExecutionResult {
        match action {
            InternalAction::ClearSession => {
                debug!(
                    used = self.session.context_tokens_used(),
                    "clearing agent session"
                );
                self.session.clear();
                self.events.emit(EngineEvent::ContextUpdate {
                    used: 0,
                    limit: self.session.context_limit(),
                    percent: 0,
                });
                ExecutionResult::succeeded(step, StepReason::Completed, started.elapsed())
                    .with_detail("session cleared")
            }
            InternalAction::ShowChanges => match self.collaborators.vcs.status() {
                Ok(files) => {
                    self.events.emit(EngineEvent::ChangedFiles { files });
                    ExecutionResult::succeeded(step, StepReason::Completed, started.elapsed())
                }
                Err(err) => ExecutionResult::failed(
                    step,
                    FailureKind::ProcessError,
                    format!("{err:#}"),
                    started.elapsed(),
                ),
            },
        }
    }

    /// A failing status query counts as dirty so the commands still run.
    fn worktree_clean(&mut self) -> bool {
        match self.collaborators.vcs.is_clean() {
            Ok(clean) => clean,
            Err(err) => {
                self.warn(format!("could not read worktree status: {err:#}"));
                false
            }
        }
    }

    fn current_commit_message(&mut self) -> String {
        match self.collaborators.vcs.status() {
            Ok(changes) => commit_message(&changes),
            Err(err) => {
                self.warn(format!("could not read worktree status: {err:#}"));
                "chore: update".to_string()
            }
        }
    }

    fn auto_commit(&mut self) {
        let vcs = self.collaborators.vcs;
        let changes = match vcs.status() {
            Ok(changes) if changes.is_empty() => return,
            Ok(changes) => changes,
            Err(err) => {
                self.warn(format!("auto-commit skipped: {err:#}"));
                return;
            }
        };
        let message = commit_message(&changes);
        match vcs.commit_all(&message) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                self.warn(format!("auto-commit failed: {err:#}"));
                return;
            }
        }
        let mut pushed = false;
        if self.config.auto_push {
            match vcs.push() {
                Ok(()) => pushed = true,
                Err(err) => self.warn(format!("push failed: {err:#}")),
            }
        }
        info!(message = %message, pushed, "auto-committed phase changes");
        self.events.emit(EngineEvent::Committed { message, pushed });
    }

    fn warn(&mut self, message: String) {
        warn!(message = %message, "engine warning");
        self.events.emit(EngineEvent::Warning { message });
    }
}

/// Every template token must name a built-in or a workflow variable.
pub fn check_template_tokens(workflow: &Workflow) -> Result<(), TemplateError> {
    for (step, token) in workflow.template_tokens() {
        let known = BUILTIN_VARIABLES.contains(&token.as_str())
            || workflow.variables().contains_key(&token);
        if !known {
            return Err(TemplateError {
                step: step.to_string(),
                token,
            });
        }
    }
    Ok(())
}

/// Run context for `phase` without the rendered `{context}` briefing.
///
/// Workflow variables are layered under the built-ins; `research_topic`
/// falls back to the phase title when the workflow does not set it.
fn base_context(
    plan: &Plan,
    phase: &Phase,
    working_dir: &Path,
    variables: &std::collections::BTreeMap<String, String>,
) -> RunContext {
    let mut ctx = RunContext::new();
    for (name, value) in variables {
        ctx.set(name.as_str(), value.as_str());
    }
    if !ctx.contains("research_topic") {
        ctx.set("research_topic", phase.title.as_str());
    }
    ctx.set("plan_path", plan.path.display().to_string());
    ctx.set("plan_directory", plan.directory().display().to_string());
    ctx.set("working_dir", working_dir.display().to_string());
    ctx.set("phase_number", phase.number.to_string());
    ctx.set("phase_title", phase.title.as_str());
    ctx.set("commit_message", COMMIT_MESSAGE_PLACEHOLDER);
    ctx
}

/// One step of a dry run, rendered against the next phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub kind: StepKind,
    /// Rendered prompt, rendered commands, or the internal action name.
    pub lines: Vec<String>,
    /// Policy flags worth showing next to the step.
    pub notes: Vec<String>,
}

/// What a run would do for the next incomplete phase, without spawning
/// anything. `None` when the plan is already complete.
pub fn dry_run(
    plan: &Plan,
    workflow: &Workflow,
    working_dir: &Path,
    config: &RunnerConfig,
) -> Result<Option<(Phase, Vec<PlannedStep>)>, EngineError> {
    check_template_tokens(workflow)?;
    let Some(phase) = plan.next_incomplete_phase() else {
        return Ok(None);
    };
    let mut ctx = base_context(plan, phase, working_dir, workflow.variables());
    ctx.set("context", render_phase_context(plan, phase)?);

    let mut planned = Vec::with_capacity(workflow.steps.len());
    for step in &workflow.steps {
        let mut notes = Vec::new();
        if step.require_success {
            notes.push("require_success".to_string());
        }
        if step.first_phase_only {
            notes.push("first_phase_only".to_string());
        }
        let lines = match &step.action {
            StepAction::Agent { prompt, stop_on, .. } => {
                if !stop_on.is_empty() {
                    let patterns: Vec<&str> = stop_on.iter().map(|p| p.source.as_str()).collect();
                    notes.push(format!("stop_on: {}", patterns.join(", ")));
                }
                vec![render(&step.name, prompt, &ctx)?]
            }
            StepAction::Shell {
                commands,
                skip_if_clean,
            } => {
                if *skip_if_clean {
                    notes.push("skip_if_clean".to_string());
                }
                let rendered = commands
                    .iter()
                    .map(|c| render(&step.name, c, &ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                if config.auto_push {
                    rendered
                } else {
                    without_push(rendered)
                }
            }
            StepAction::Internal(action) => vec![action.as_str().to_string()],
        };
        planned.push(PlannedStep {
            name: step.name.clone(),
            kind: step.kind(),
            lines,
            notes,
        });
    }
    Ok(Some((phase.clone(), planned)))
}
