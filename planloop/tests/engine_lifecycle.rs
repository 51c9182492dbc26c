//! Whole-run engine scenarios.
//!
//! Each test drives `WorkflowEngine::run` against a temp plan file with a
//! scripted agent (canned `stream-json` replayed through `sh`), an in-memory
//! worktree and a recording shell, then inspects the outcome, the recorded
//! agent requests and the emitted events.
#![cfg(unix)]

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use planloop::core::types::{RunOutcome, RunState, StepReason};
use planloop::core::workflow::{Workflow, WorkflowFormat, default_workflow, parse_workflow};
use planloop::engine::{Collaborators, WorkflowEngine};
use planloop::error::{EngineError, FailureKind};
use planloop::events::{EngineEvent, EventLog};
use planloop::io::config::RunnerConfig;
use planloop::test_support::{
    RecordingShell, ScriptedAgent, ScriptedTurn, ScriptedVcs, TestWorkspace, assistant_line,
    plan_text, result_line,
};

fn workflow(yaml: &str) -> Workflow {
    parse_workflow("test workflow", yaml, WorkflowFormat::Yaml).expect("workflow")
}

fn config() -> RunnerConfig {
    RunnerConfig {
        stop_grace_secs: 1,
        auto_push: false,
        ..RunnerConfig::default()
    }
}

fn build_engine<'a>(
    ws: &TestWorkspace,
    workflow: Workflow,
    config: RunnerConfig,
    collaborators: Collaborators<'a>,
) -> (WorkflowEngine<'a>, Receiver<EngineEvent>) {
    let (events, rx) = EventLog::channel(4096);
    let engine = WorkflowEngine::new(
        ws.plan_path(),
        ws.path(),
        workflow,
        config,
        collaborators,
        events,
    );
    (engine, rx)
}

fn step_reasons(events: &[EngineEvent], step: &str) -> Vec<(usize, StepReason)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::StepResult { iteration, result } if result.step == step => {
                Some((*iteration, result.reason.clone()))
            }
            _ => None,
        })
        .collect()
}

const IMPLEMENT_ONLY: &str = "
name: implement only
steps:
  - name: implement
    type: agent
    prompt: Implement phase {phase_number} ({phase_title}) of {plan_path}
";

#[test]
fn default_workflow_finishes_remaining_phase() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["complete", "pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![
            ScriptedTurn::ok("Implemented phase 2.")
                .rewriting_plan(plan_text(&["complete", "complete"])),
            ScriptedTurn::ok("Everything works."),
            ScriptedTurn::ok("Summary updated."),
            ScriptedTurn::ok("Committed."),
        ],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let (mut engine, rx) = build_engine(
        &ws,
        default_workflow().expect("default"),
        config(),
        collaborators,
    );

    let outcome = engine.run().expect("run");
    let RunOutcome::Completed {
        progress,
        iterations,
    } = outcome
    else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!((progress.completed, progress.total), (2, 2));
    assert_eq!(iterations, 1);
    assert_eq!(engine.state(), &RunState::Completed);

    // clear_session ran last: meter and session id are reset.
    assert_eq!(engine.session().context_tokens_used(), 0);
    assert_eq!(engine.session().session_id(), None);

    let requests = agent.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[0].prompt.contains(&ws.plan_path().display().to_string()));
    assert_eq!(requests[0].resume_session, None);
    assert_eq!(requests[1].resume_session.as_deref(), Some("sess-1"));
    assert_eq!(agent.remaining(), 0);

    engine.finish();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(matches!(events.first(), Some(EngineEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(EngineEvent::RunFinished { state, .. }) if state == "completed"
    ));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::TextDelta { step, text } if step == "implement" && text == "Implemented phase 2."
    )));
}

#[test]
fn first_phase_only_step_runs_once_per_run() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending", "pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![
            ScriptedTurn::ok("one").rewriting_plan(plan_text(&["complete", "pending"])),
            ScriptedTurn::ok("two").rewriting_plan(plan_text(&["complete", "complete"])),
        ],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: setup once
steps:
  - name: setup
    type: shell
    commands: [npm install]
    first_phase_only: true
  - name: implement
    type: agent
    prompt: Implement phase {phase_number} ({phase_title}) of {plan_path}
",
    );
    let (mut engine, rx) = build_engine(&ws, flow, config(), collaborators);

    let outcome = engine.run().expect("run");
    assert!(matches!(outcome, RunOutcome::Completed { iterations: 2, .. }));
    assert_eq!(shell.commands(), vec!["npm install".to_string()]);

    let prompts = agent.prompts();
    assert!(prompts[0].starts_with("Implement phase 1 (Part 1)"), "{prompts:?}");
    assert!(prompts[1].starts_with("Implement phase 2 (Part 2)"), "{prompts:?}");

    engine.finish();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert_eq!(
        step_reasons(&events, "setup"),
        vec![
            (0, StepReason::Completed),
            (1, StepReason::SkippedFirstPhaseOnly)
        ]
    );
}

#[test]
fn required_step_failure_ends_run_before_later_steps() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(ws.plan_path(), vec![ScriptedTurn::ok("unused")]).expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::failing(&["cargo test"]);
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: gated
steps:
  - name: tests
    type: shell
    commands: [cargo test, cargo clippy]
    require_success: true
  - name: implement
    type: agent
    prompt: go
",
    );
    let (mut engine, rx) = build_engine(&ws, flow, config(), collaborators);

    let err = engine.run().expect_err("required step fails");
    match &err {
        EngineError::StepFailure { step, kind, detail } => {
            assert_eq!(step, "tests");
            assert_eq!(*kind, FailureKind::ProcessError);
            assert!(detail.contains("`cargo test` exited with code 1"), "{detail}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(engine.state(), &RunState::Failed);
    // The shell step stops at the first failing command; the agent never runs.
    assert_eq!(shell.commands(), vec!["cargo test".to_string()]);
    assert!(agent.requests().is_empty());

    engine.finish();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(matches!(
        events.last(),
        Some(EngineEvent::RunFinished { state, detail: Some(_), .. }) if state == "failed"
    ));
}

#[test]
fn optional_step_failure_is_tolerated() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![ScriptedTurn::ok("done").rewriting_plan(plan_text(&["complete"]))],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::failing(&["make lint"]);
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: lenient
steps:
  - name: lint
    type: shell
    commands: [make lint]
  - name: implement
    type: agent
    prompt: go
",
    );
    let (mut engine, _rx) = build_engine(&ws, flow, config(), collaborators);

    assert!(matches!(engine.run(), Ok(RunOutcome::Completed { .. })));
    assert_eq!(agent.requests().len(), 1);
}

#[test]
fn low_confidence_fails_required_agent_step() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let unsure = ScriptedTurn {
        lines: vec![
            assistant_line("Some tests are flaky.", 500),
            result_line("sess-9", Some(0.4)),
        ],
        ..ScriptedTurn::default()
    };
    let agent = ScriptedAgent::new(ws.plan_path(), vec![unsure]).expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: verify
steps:
  - name: verify
    type: agent
    prompt: verify phase {phase_number}
    require_success: true
",
    );
    let (mut engine, _rx) = build_engine(&ws, flow, config(), collaborators);

    match engine.run() {
        Err(EngineError::StepFailure { step, kind, detail }) => {
            assert_eq!(step, "verify");
            assert_eq!(kind, FailureKind::LowConfidence);
            assert_eq!(detail, "confidence 0.40 below threshold 0.80");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn skip_if_clean_consults_worktree() {
    let flow_yaml = "
name: commit
steps:
  - name: implement
    type: agent
    prompt: go
  - name: commit
    type: shell
    commands: [\"git add -A && git commit -m '{commit_message}'\"]
    skip_if_clean: true
";

    for (vcs, expected) in [
        (ScriptedVcs::clean(), vec![]),
        (
            ScriptedVcs::dirty(&["src/lib.rs"]),
            vec!["git add -A && git commit -m 'feat(src): update lib.rs'".to_string()],
        ),
    ] {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_plan(&plan_text(&["pending"])).expect("plan");
        let agent = ScriptedAgent::new(
            ws.plan_path(),
            vec![ScriptedTurn::ok("done").rewriting_plan(plan_text(&["complete"]))],
        )
        .expect("agent");
        let shell = RecordingShell::new();
        let collaborators = Collaborators {
            backend: &agent,
            vcs: &vcs,
            shell: &shell,
        };
        let (mut engine, rx) = build_engine(&ws, workflow(flow_yaml), config(), collaborators);

        assert!(matches!(engine.run(), Ok(RunOutcome::Completed { .. })));
        assert_eq!(shell.commands(), expected);

        engine.finish();
        let events: Vec<EngineEvent> = rx.try_iter().collect();
        let expected_reason = if expected.is_empty() {
            StepReason::SkippedClean
        } else {
            StepReason::Completed
        };
        assert_eq!(step_reasons(&events, "commit"), vec![(0, expected_reason)]);
    }
}

#[test]
fn push_commands_are_filtered_unless_enabled() {
    let flow_yaml = "
name: ship
steps:
  - name: implement
    type: agent
    prompt: go
  - name: ship
    type: shell
    commands: [git commit -am wip, git push origin main]
";
    for (auto_push, expected) in [
        (false, vec!["git commit -am wip"]),
        (true, vec!["git commit -am wip", "git push origin main"]),
    ] {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_plan(&plan_text(&["pending"])).expect("plan");
        let agent = ScriptedAgent::new(
            ws.plan_path(),
            vec![ScriptedTurn::ok("done").rewriting_plan(plan_text(&["complete"]))],
        )
        .expect("agent");
        let vcs = ScriptedVcs::clean();
        let shell = RecordingShell::new();
        let collaborators = Collaborators {
            backend: &agent,
            vcs: &vcs,
            shell: &shell,
        };
        let cfg = RunnerConfig {
            auto_push,
            ..config()
        };
        let (mut engine, _rx) = build_engine(&ws, workflow(flow_yaml), cfg, collaborators);

        assert!(matches!(engine.run(), Ok(RunOutcome::Completed { .. })));
        assert_eq!(shell.commands(), expected);
    }
}

#[test]
fn stop_pattern_ends_agent_step_and_run_continues() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let chatty = ScriptedTurn {
        lines: vec![assistant_line("Checking... ALL TESTS PASSED", 800)],
        hang: true,
        ..ScriptedTurn::default()
    };
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![
            chatty,
            ScriptedTurn::ok("marked done").rewriting_plan(plan_text(&["complete"])),
        ],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: watch
steps:
  - name: verify
    type: agent
    prompt: run the tests
    stop_on: ['tests\\s+passed']
  - name: finish
    type: agent
    prompt: mark the phase complete
",
    );
    let (mut engine, rx) = build_engine(&ws, flow, config(), collaborators);

    let started = Instant::now();
    assert!(matches!(engine.run(), Ok(RunOutcome::Completed { .. })));
    // The hanging agent was terminated, not waited out.
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(agent.remaining(), 0);

    engine.finish();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert_eq!(
        step_reasons(&events, "verify"),
        vec![(
            0,
            StepReason::StopPatternMatched {
                pattern: "tests\\s+passed".to_string()
            }
        )]
    );
}

#[test]
fn stop_request_interrupts_running_agent() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending", "pending"])).expect("plan");
    let slow = ScriptedTurn {
        lines: vec![assistant_line("Working on it", 100)],
        hang: true,
        ..ScriptedTurn::default()
    };
    let agent = ScriptedAgent::new(ws.plan_path(), vec![slow, ScriptedTurn::ok("unused")])
        .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let (mut engine, rx) = build_engine(&ws, workflow(IMPLEMENT_ONLY), config(), collaborators);
    let controller = engine.controller();

    let started = Instant::now();
    let outcome = thread::scope(|scope| {
        scope.spawn(|| {
            while agent.requests().is_empty() && started.elapsed() < Duration::from_secs(10) {
                thread::sleep(Duration::from_millis(20));
            }
            thread::sleep(Duration::from_millis(100));
            controller.stop();
        });
        engine.run()
    });

    assert!(matches!(outcome, Ok(RunOutcome::Stopped { iterations: 1, .. })));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(engine.state(), &RunState::Stopped);
    assert_eq!(agent.remaining(), 1);
    // Nothing was written to the plan on the way out.
    assert_eq!(
        ws.read_plan().expect("plan"),
        plan_text(&["pending", "pending"])
    );

    engine.finish();
    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(matches!(
        events.last(),
        Some(EngineEvent::RunFinished { state, .. }) if state == "stopped"
    ));
}

#[test]
fn pause_holds_run_until_resume() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![ScriptedTurn::ok("done").rewriting_plan(plan_text(&["complete"]))],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let (mut engine, rx) = build_engine(&ws, workflow(IMPLEMENT_ONLY), config(), collaborators);
    let controller = engine.controller();
    assert!(controller.pause());

    let outcome = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(200));
            // Still parked at the first step boundary.
            assert!(agent.requests().is_empty());
            controller.resume();
        });
        engine.run()
    });

    assert!(matches!(outcome, Ok(RunOutcome::Completed { .. })));
    assert_eq!(agent.requests().len(), 1);

    engine.finish();
    let pauses: Vec<bool> = rx
        .try_iter()
        .filter_map(|event| match event {
            EngineEvent::PauseChanged { paused } => Some(paused),
            _ => None,
        })
        .collect();
    assert_eq!(pauses, vec![true, false]);
}

#[test]
fn manual_override_replaces_exactly_one_prompt() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![
            ScriptedTurn::ok("fixed"),
            ScriptedTurn::ok("done").rewriting_plan(plan_text(&["complete"])),
        ],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: two agents
steps:
  - name: implement
    type: agent
    prompt: implement {phase_title}
  - name: review
    type: agent
    prompt: review {phase_title}
",
    );
    let (mut engine, rx) = build_engine(&ws, flow, config(), collaborators);
    engine
        .controller()
        .manual_override("Fix the failing login test first");

    assert!(matches!(engine.run(), Ok(RunOutcome::Completed { .. })));
    assert_eq!(
        agent.prompts(),
        vec![
            "Fix the failing login test first".to_string(),
            "review Part 1".to_string()
        ]
    );

    engine.finish();
    assert!(rx.try_iter().any(|e| matches!(
        e,
        EngineEvent::OverrideQueued { prompt } if prompt == "Fix the failing login test first"
    )));
}

#[test]
fn plan_without_phases_fails_before_any_agent_runs() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan("# Notes\n\nJust some thoughts, no phases.\n")
        .expect("plan");
    let agent = ScriptedAgent::new(ws.plan_path(), vec![ScriptedTurn::ok("unused")]).expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let (mut engine, _rx) = build_engine(
        &ws,
        default_workflow().expect("default"),
        config(),
        collaborators,
    );

    assert!(matches!(engine.run(), Err(EngineError::Parse(_))));
    assert!(agent.requests().is_empty());
    assert_eq!(agent.remaining(), 1);
    assert!(shell.commands().is_empty());
}

#[test]
fn unknown_template_token_fails_before_any_agent_runs() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(ws.plan_path(), vec![ScriptedTurn::ok("unused")]).expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let flow = workflow(
        "
name: typo
steps:
  - name: implement
    type: agent
    prompt: go
  - name: review
    type: agent
    prompt: review {phase_titel}
",
    );
    let (mut engine, _rx) = build_engine(&ws, flow, config(), collaborators);

    match engine.run() {
        Err(EngineError::Template(err)) => {
            assert_eq!(err.step, "review");
            assert_eq!(err.token, "phase_titel");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(agent.requests().is_empty());
}

#[test]
fn auto_commit_after_each_phase() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![ScriptedTurn::ok("done").rewriting_plan(plan_text(&["complete"]))],
    )
    .expect("agent");
    let vcs = ScriptedVcs::dirty(&["src/auth/login.rs", "src/auth/mod.rs"]);
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let cfg = RunnerConfig {
        auto_commit: true,
        ..config()
    };
    let (mut engine, rx) = build_engine(&ws, workflow(IMPLEMENT_ONLY), cfg, collaborators);

    assert!(matches!(engine.run(), Ok(RunOutcome::Completed { .. })));
    assert_eq!(vcs.commits(), vec!["feat(src): update 2 files".to_string()]);
    assert_eq!(vcs.pushes(), 0);

    engine.finish();
    assert!(rx.try_iter().any(|e| matches!(
        e,
        EngineEvent::Committed { pushed: false, .. }
    )));
}

#[test]
fn unfinished_plan_hits_iteration_limit() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan_text(&["pending"])).expect("plan");
    let agent = ScriptedAgent::new(
        ws.plan_path(),
        vec![ScriptedTurn::ok("tried"), ScriptedTurn::ok("tried again")],
    )
    .expect("agent");
    let vcs = ScriptedVcs::clean();
    let shell = RecordingShell::new();
    let collaborators = Collaborators {
        backend: &agent,
        vcs: &vcs,
        shell: &shell,
    };
    let cfg = RunnerConfig {
        max_iterations: 2,
        ..config()
    };
    let (mut engine, _rx) = build_engine(&ws, workflow(IMPLEMENT_ONLY), cfg, collaborators);

    assert!(matches!(engine.run(), Err(EngineError::IterationLimit(2))));
    assert_eq!(agent.requests().len(), 2);
}
