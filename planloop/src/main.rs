//! `planloop`: drive a coding agent through a multi-phase plan.
//!
//! `run` loops the workflow over the plan's phases until every phase is
//! complete; `preview` shows how the plan parses; `workflow` manages the
//! project and global workflow files.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};

use planloop::core::types::RunOutcome;
use planloop::core::workflow::to_yaml;
use planloop::engine::{Collaborators, WorkflowEngine, dry_run};
use planloop::error::EngineError;
use planloop::events::{EventLog, Renderer};
use planloop::exit_codes;
use planloop::io::agent::ClaudeBackend;
use planloop::io::config::{RunnerConfig, config_path, load_config};
use planloop::io::git::Git;
use planloop::io::keyboard::{KeyboardListener, install_ctrlc};
use planloop::io::plan_store::{load_plan, resolve_working_dir};
use planloop::io::run_log::JsonlRunLog;
use planloop::io::shell::SystemShell;
use planloop::io::workflow_store::{
    WorkflowDirs, init_workflow, load_workflow, reset_workflow,
};
use planloop::logging;
use planloop::preview::{render_dry_run, render_plan};
use planloop::render::ConsoleRenderer;

#[derive(Parser)]
#[command(
    name = "planloop",
    version,
    about = "Drive a coding agent through a multi-phase implementation plan"
)]
struct Cli {
    /// Debug-level tracing on stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workflow over every incomplete phase of PLAN.
    Run(RunArgs),
    /// Show how PLAN parses without running anything.
    Preview {
        plan: PathBuf,
    },
    /// Inspect or manage workflow files.
    #[command(subcommand)]
    Workflow(WorkflowCommand),
}

#[derive(Args)]
struct RunArgs {
    plan: PathBuf,

    /// Workflow file (default: project, then global, then built-in).
    #[arg(long)]
    workflow: Option<PathBuf>,

    /// Directory the agent and shell steps run in.
    #[arg(short = 'w', long)]
    working_dir: Option<PathBuf>,

    /// No keyboard control; Ctrl-C stops the run.
    #[arg(long)]
    headless: bool,

    /// Minimum agent confidence (0.0-1.0) for a step to succeed.
    #[arg(long)]
    confidence_threshold: Option<f64>,

    /// Commit leftover changes after every phase.
    #[arg(long, overrides_with = "no_auto_commit")]
    auto_commit: bool,

    #[arg(long)]
    no_auto_commit: bool,

    /// Allow `git push` (shell steps and auto-commit).
    #[arg(long, overrides_with = "no_push")]
    push: bool,

    #[arg(long)]
    no_push: bool,

    /// Print what the next phase would run and exit.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut RunnerConfig) {
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold;
        }
        if self.auto_commit {
            config.auto_commit = true;
        }
        if self.no_auto_commit {
            config.auto_commit = false;
        }
        if self.push {
            config.auto_push = true;
        }
        if self.no_push {
            config.auto_push = false;
        }
    }
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Print the active workflow and where it came from.
    Show {
        #[arg(short = 'w', long)]
        working_dir: Option<PathBuf>,
    },
    /// Write the built-in workflow as a starting point.
    Init {
        #[arg(short = 'w', long)]
        working_dir: Option<PathBuf>,
        /// Write to the global config directory instead of the project.
        #[arg(long)]
        global: bool,
        /// Overwrite an existing workflow file.
        #[arg(short, long)]
        force: bool,
    },
    /// Remove workflow files so the next run falls back a level.
    Reset {
        #[arg(short = 'w', long)]
        working_dir: Option<PathBuf>,
        #[arg(long)]
        global: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Preview { plan } => cmd_preview(&plan),
        Command::Workflow(command) => cmd_workflow(command),
    }
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let plan_path = args
        .plan
        .canonicalize()
        .with_context(|| format!("plan {}", args.plan.display()))?;
    let working_dir = resolve_working_dir(&plan_path, args.working_dir.as_deref())?;
    let mut config = load_config(&config_path(&working_dir))?;
    args.apply(&mut config);
    config.validate().context("invalid run options")?;
    let dirs = WorkflowDirs::for_working_dir(&working_dir);
    let (workflow, source) = load_workflow(args.workflow.as_deref(), &dirs)?;
    debug!(source = %source, workflow = workflow.name(), "workflow loaded");

    if args.dry_run {
        let plan = load_plan(&plan_path)?;
        println!("Workflow: {} ({source})", workflow.name());
        println!("Working dir: {}\n", working_dir.display());
        match dry_run(&plan, &workflow, &working_dir, &config)? {
            Some((phase, steps)) => print!("{}", render_dry_run(&phase, &steps)),
            None => println!("All phases complete; nothing to run."),
        }
        return Ok(exit_codes::OK);
    }

    let interactive =
        !args.headless && std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
    let mut renderers: Vec<Box<dyn Renderer>> = vec![Box::new(ConsoleRenderer::stdout(interactive))];
    match JsonlRunLog::create(&working_dir, &plan_path) {
        Ok(log) => {
            eprintln!("run log: {}", log.path().display());
            renderers.push(Box::new(log));
        }
        Err(err) => warn!(err = %format!("{err:#}"), "run log disabled"),
    }
    let events = EventLog::spawn(config.event_buffer, renderers);

    let backend = ClaudeBackend::new(config.agent.binary.clone());
    let git = Git::new(&working_dir);
    let shell = SystemShell;
    let collaborators = Collaborators {
        backend: &backend,
        vcs: &git,
        shell: &shell,
    };
    let mut engine = WorkflowEngine::new(
        plan_path,
        working_dir,
        workflow,
        config,
        collaborators,
        events,
    );

    let listener = if interactive {
        Some(KeyboardListener::spawn(engine.controller())?)
    } else {
        install_ctrlc(engine.controller())?;
        None
    };
    let result = engine.run();
    if let Some(listener) = listener {
        listener.shutdown();
    }
    let stats = engine.finish();
    debug!(
        sent = stats.sent,
        coalesced = stats.coalesced,
        dropped = stats.dropped,
        "event log closed"
    );

    Ok(match result {
        Ok(RunOutcome::Completed { .. }) => exit_codes::OK,
        Ok(RunOutcome::Stopped { .. }) => exit_codes::STOPPED,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    })
}

fn exit_code_for(err: &EngineError) -> i32 {
    match err {
        EngineError::StepFailure { .. } | EngineError::IterationLimit(_) => exit_codes::FAILED,
        EngineError::Parse(_) | EngineError::Template(_) | EngineError::Other(_) => {
            exit_codes::INVALID
        }
    }
}

fn cmd_preview(plan_path: &Path) -> Result<i32> {
    let plan = load_plan(plan_path)?;
    print!("{}", render_plan(&plan));
    Ok(exit_codes::OK)
}

fn cmd_workflow(command: WorkflowCommand) -> Result<i32> {
    match command {
        WorkflowCommand::Show { working_dir } => {
            let dirs = WorkflowDirs::for_working_dir(&base_dir(working_dir)?);
            let (workflow, source) = load_workflow(None, &dirs)?;
            println!("# source: {source}");
            print!(
                "{}",
                to_yaml(&workflow.definition).context("serialize workflow")?
            );
        }
        WorkflowCommand::Init {
            working_dir,
            global,
            force,
        } => {
            let dirs = WorkflowDirs::for_working_dir(&base_dir(working_dir)?);
            let path = init_workflow(dirs.scope_dir(global)?, force)?;
            println!("wrote {}", path.display());
        }
        WorkflowCommand::Reset {
            working_dir,
            global,
        } => {
            let dirs = WorkflowDirs::for_working_dir(&base_dir(working_dir)?);
            let removed = reset_workflow(dirs.scope_dir(global)?)?;
            if removed.is_empty() {
                println!("no workflow file to remove");
            }
            for path in removed {
                println!("removed {}", path.display());
            }
        }
    }
    Ok(exit_codes::OK)
}

fn base_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("current directory"),
    }
}
