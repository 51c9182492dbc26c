//! One agent process per agent step.
//!
//! The driver spawns the backend's command, forwards its stdout lines into the
//! engine [`Mailbox`] from a reader thread, and consumes them at the
//! agent-read suspension point. Each line is classified into [`AgentEvent`]s
//! that feed the context meter, the stop patterns and the event log.
//!
//! A step ends in one of four ways:
//! - a `Stop` control signal: graceful termination, result `StopRequested`;
//! - a `stop_on` match in the streamed text: graceful termination, success;
//! - process exit: success, `ProcessError` or `LowConfidence` depending on the
//!   exit status and the final result event;
//! - a spawn failure: `ProcessError`.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::control::{AgentItem, AgentRead, AgentSink, Mailbox};
use crate::core::session::SessionState;
use crate::core::stream::{AgentEvent, Completion, ConfidenceSource, classify_line};
use crate::core::types::{ExecutionResult, StepReason};
use crate::core::workflow::StopPattern;
use crate::error::FailureKind;
use crate::events::{EngineEvent, EventLog};
use crate::io::agent::{AgentBackend, AgentRequest};
use crate::io::process::{
    PIPE_DRAIN, join_output_within, own_process_group, read_stream_limited, terminate_gracefully,
};

/// stderr kept for failure details.
const STDERR_LIMIT_BYTES: usize = 64 * 1024;
/// Lines of stderr or result text quoted in a failure detail.
const DETAIL_TAIL_LINES: usize = 20;
/// Confidence assumed for a result that reports none.
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// One agent step, ready to run.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub step: String,
    pub request: AgentRequest,
    pub stop_on: Vec<StopPattern>,
    /// Forward text deltas to the event log.
    pub stream: bool,
}

/// Borrowed engine state for the duration of one agent step.
pub struct SessionDriver<'a> {
    pub backend: &'a dyn AgentBackend,
    pub mailbox: &'a mut Mailbox,
    pub session: &'a mut SessionState,
    pub events: &'a mut EventLog,
    pub confidence_threshold: f64,
    pub stop_grace: Duration,
}

enum Ending {
    Exited,
    StopRequested,
    PatternMatched(String),
}

impl SessionDriver<'_> {
    /// Run the invocation to completion. Failures are reported in the result,
    /// never as `Err`.
    #[instrument(skip_all, fields(step = %invocation.step))]
    pub fn run(&mut self, invocation: &AgentInvocation) -> ExecutionResult {
        let started = Instant::now();
        match self.drive(invocation, started) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent invocation failed");
                ExecutionResult::failed(
                    &invocation.step,
                    FailureKind::ProcessError,
                    format!("{err:#}"),
                    started.elapsed(),
                )
            }
        }
    }

    fn drive(&mut self, invocation: &AgentInvocation, started: Instant) -> Result<ExecutionResult> {
        let mut cmd = self.backend.command(&invocation.request)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut cmd);
        debug!(resume = invocation.request.resume_session.is_some(), "spawning agent");
        let mut child = cmd.spawn().context("spawn agent process")?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("agent stdio was not piped"));
            }
        };
        let sink = self.mailbox.begin_agent();
        let reader = thread::spawn(move || forward_lines(stdout, sink));
        let stderr_reader = spawn_stderr_reader(stderr);

        let mut completion = None;
        let ending = self.consume(invocation, &mut completion);

        let status = match &ending {
            Ending::Exited => {
                self.mailbox.end_agent();
                if reader.join().is_err() {
                    warn!("agent stdout reader panicked");
                }
                child.wait().context("wait for agent")
            }
            Ending::StopRequested | Ending::PatternMatched(_) => {
                let stopped = self.terminate(&mut child);
                // A descendant outside the group may keep stdout open; the
                // reader is left behind and its late lines are discarded.
                self.mailbox.end_agent();
                stopped
            }
        };
        let stderr = stderr_text(stderr_reader);
        let status = status?;
        let elapsed = started.elapsed();

        Ok(match ending {
            Ending::StopRequested => {
                info!("agent stopped on request");
                ExecutionResult::stop_requested(&invocation.step, elapsed)
            }
            Ending::PatternMatched(pattern) => {
                info!(pattern = %pattern, "stop pattern matched");
                ExecutionResult::succeeded(
                    &invocation.step,
                    StepReason::StopPatternMatched { pattern },
                    elapsed,
                )
            }
            Ending::Exited => self.evaluate(&invocation.step, status, completion, &stderr, elapsed),
        })
    }

    /// Agent-read suspension point loop. Returns once the stream ends, a stop
    /// pattern matches, or a `Stop` arrives.
    fn consume(&mut self, invocation: &AgentInvocation, completion: &mut Option<Completion>) -> Ending {
        let mut visible = String::new();
        loop {
            let line = match self.mailbox.next_agent() {
                AgentRead::Stop => return Ending::StopRequested,
                AgentRead::Item(AgentItem::Eof) => return Ending::Exited,
                AgentRead::Item(AgentItem::Line(line)) => line,
            };
            for event in classify_line(&line) {
                match event {
                    AgentEvent::TextDelta { text } => {
                        visible.push_str(&text);
                        if invocation.stream {
                            self.events.emit(EngineEvent::TextDelta {
                                step: invocation.step.clone(),
                                text,
                            });
                        }
                        if let Some(pattern) = invocation.stop_on.iter().find(|p| p.is_match(&visible)) {
                            return Ending::PatternMatched(pattern.source.clone());
                        }
                    }
                    AgentEvent::ToolCall { name, summary } => {
                        debug!(tool = %name, "tool call");
                        self.events.emit(EngineEvent::ToolCall {
                            step: invocation.step.clone(),
                            name,
                            summary,
                        });
                    }
                    AgentEvent::ToolResult { is_error } => {
                        if is_error {
                            debug!("tool reported an error");
                        }
                    }
                    AgentEvent::UsageUpdate { context_tokens } => self.record_usage(context_tokens),
                    AgentEvent::Completion(done) => {
                        if let Some(id) = &done.session_id {
                            self.session.set_session_id(id.clone());
                        }
                        *completion = Some(done);
                    }
                    AgentEvent::Skip => {}
                }
            }
        }
    }

    fn record_usage(&mut self, context_tokens: u64) {
        let reached_limit = self.session.record_usage(context_tokens);
        self.events.emit(EngineEvent::ContextUpdate {
            used: self.session.context_tokens_used(),
            limit: self.session.context_limit(),
            percent: self.session.context_percent(),
        });
        if reached_limit {
            warn!(
                used = self.session.context_tokens_used(),
                limit = self.session.context_limit(),
                "context limit reached"
            );
            self.events.emit(EngineEvent::Warning {
                message: format!(
                    "context usage reached the {}-token limit; a clear_session step will reset it",
                    self.session.context_limit()
                ),
            });
        }
    }

    fn terminate(&self, child: &mut Child) -> Result<ExitStatus> {
        let (status, forced) =
            terminate_gracefully(child, self.stop_grace).context("terminate agent")?;
        if forced {
            warn!(grace_ms = self.stop_grace.as_millis() as u64, "agent force-killed");
        }
        Ok(status)
    }

    fn evaluate(
        &self,
        step: &str,
        status: ExitStatus,
        completion: Option<Completion>,
        stderr: &str,
        elapsed: Duration,
    ) -> ExecutionResult {
        if !status.success() {
            let mut detail = format!("agent exited with {status}");
            append_tail(&mut detail, stderr);
            return ExecutionResult::failed(step, FailureKind::ProcessError, detail, elapsed);
        }
        let Some(completion) = completion else {
            let mut detail = "agent exited without a result event".to_string();
            append_tail(&mut detail, stderr);
            return ExecutionResult::failed(step, FailureKind::ProcessError, detail, elapsed);
        };
        if completion.is_error {
            let mut detail = "agent reported an error".to_string();
            append_tail(&mut detail, &completion.result);
            return ExecutionResult::failed(step, FailureKind::ProcessError, detail, elapsed);
        }

        let confidence = match completion.confidence {
            Some(reported) => {
                if reported.source == ConfidenceSource::TextHeuristic {
                    debug!(value = reported.value, "confidence taken from result text");
                }
                reported.value
            }
            None => {
                debug!(value = DEFAULT_CONFIDENCE, "no confidence reported, using default");
                DEFAULT_CONFIDENCE
            }
        };
        if confidence < self.confidence_threshold {
            let detail = format!(
                "confidence {confidence:.2} below threshold {:.2}",
                self.confidence_threshold
            );
            return ExecutionResult::failed(step, FailureKind::LowConfidence, detail, elapsed)
                .with_confidence(Some(confidence));
        }
        ExecutionResult::succeeded(step, StepReason::Completed, elapsed)
            .with_confidence(Some(confidence))
    }
}

/// Forward stdout lines to the mailbox until EOF or until the engine is gone.
fn forward_lines(stdout: ChildStdout, sink: AgentSink) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if !sink.send(AgentItem::Line(line)) {
                    return;
                }
            }
            Err(err) => {
                debug!(err = %err, invocation = sink.invocation(), "agent stdout read failed");
                break;
            }
        }
    }
    sink.send(AgentItem::Eof);
}

fn spawn_stderr_reader(stderr: ChildStderr) -> JoinHandle<Result<(Vec<u8>, usize)>> {
    thread::spawn(move || read_stream_limited(stderr, STDERR_LIMIT_BYTES))
}

fn stderr_text(handle: JoinHandle<Result<(Vec<u8>, usize)>>) -> String {
    match join_output_within(handle, PIPE_DRAIN) {
        Ok((bytes, _)) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            debug!(err = %err, "agent stderr unavailable");
            String::new()
        }
    }
}

fn append_tail(detail: &mut String, text: &str) {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return;
    }
    let start = lines.len().saturating_sub(DETAIL_TAIL_LINES);
    detail.push('\n');
    detail.push_str(&lines[start..].join("\n"));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::workflow::{WorkflowFormat, parse_workflow};
    use std::path::PathBuf;
    use std::process::Command;

    /// Replays a fixed shell script instead of an agent.
    struct ShBackend(String);

    impl AgentBackend for ShBackend {
        fn command(&self, _request: &AgentRequest) -> Result<Command> {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.0);
            Ok(cmd)
        }
    }

    struct Harness {
        mailbox: Mailbox,
        session: SessionState,
        events: EventLog,
        rx: crossbeam_channel::Receiver<EngineEvent>,
        threshold: f64,
        stop_grace: Duration,
    }

    impl Harness {
        fn new() -> Self {
            let (events, rx) = EventLog::channel(1024);
            Self {
                mailbox: Mailbox::new(64),
                session: SessionState::new(1_000),
                events,
                rx,
                threshold: 0.8,
                stop_grace: Duration::from_secs(2),
            }
        }

        fn run(&mut self, script: &str, invocation: &AgentInvocation) -> ExecutionResult {
            let backend = ShBackend(script.to_string());
            SessionDriver {
                backend: &backend,
                mailbox: &mut self.mailbox,
                session: &mut self.session,
                events: &mut self.events,
                confidence_threshold: self.threshold,
                stop_grace: self.stop_grace,
            }
            .run(invocation)
        }

        fn events(&self) -> Vec<EngineEvent> {
            self.rx.try_iter().collect()
        }
    }

    fn invocation(stop_on: &[&str]) -> AgentInvocation {
        let mut yaml = String::from("name: t\nsteps:\n  - name: s\n    prompt: go\n");
        if !stop_on.is_empty() {
            yaml.push_str("    stop_on:\n");
            for pattern in stop_on {
                yaml.push_str(&format!("      - '{pattern}'\n"));
            }
        }
        let workflow = parse_workflow("test", &yaml, WorkflowFormat::Yaml).expect("workflow");
        let stop_on = match &workflow.steps[0].action {
            crate::core::workflow::StepAction::Agent { stop_on, .. } => stop_on.clone(),
            _ => Vec::new(),
        };
        AgentInvocation {
            step: "s".to_string(),
            request: AgentRequest {
                workdir: PathBuf::from("."),
                prompt: "go".to_string(),
                allowed_tools: Vec::new(),
                resume_session: None,
                extra_args: Vec::new(),
            },
            stop_on,
            stream: true,
        }
    }

    fn script(lines: &[&str], exit: i32) -> String {
        let mut out = String::new();
        for line in lines {
            out.push_str(&format!("echo '{line}'; "));
        }
        out.push_str(&format!("exit {exit}"));
        out
    }

    const ASSISTANT: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Phase done."}],"usage":{"input_tokens":300,"output_tokens":20}}}"#;
    const RESULT_OK: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"sess-9","structured_output":{"confidence":0.95}}"#;
    const RESULT_LOW: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"unsure","structured_output":{"confidence":0.4}}"#;

    #[test]
    fn successful_run_records_usage_and_session() {
        let mut h = Harness::new();
        let result = h.run(&script(&["not json", ASSISTANT, RESULT_OK], 0), &invocation(&[]));
        assert!(result.success, "{result:?}");
        assert_eq!(result.reason, StepReason::Completed);
        assert_eq!(result.confidence, Some(0.95));
        assert_eq!(h.session.context_tokens_used(), 320);
        assert_eq!(h.session.session_id(), Some("sess-9"));

        let events = h.events();
        assert!(events.contains(&EngineEvent::TextDelta {
            step: "s".to_string(),
            text: "Phase done.".to_string()
        }));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::ContextUpdate { used: 320, .. })));
    }

    #[test]
    fn low_confidence_and_nonzero_exit_fail_with_distinct_kinds() {
        let mut h = Harness::new();
        let low = h.run(&script(&[RESULT_LOW], 0), &invocation(&[]));
        assert!(!low.success);
        assert_eq!(low.failure, Some(FailureKind::LowConfidence));

        let crashed = h.run("echo boom >&2; exit 7", &invocation(&[]));
        assert_eq!(crashed.failure, Some(FailureKind::ProcessError));
        assert!(crashed.detail.contains("boom"), "{}", crashed.detail);
    }

    #[test]
    fn missing_confidence_is_judged_at_the_default() {
        const RESULT_BARE: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"done"}"#;
        let mut h = Harness::new();
        let passed = h.run(&script(&[RESULT_BARE], 0), &invocation(&[]));
        assert!(passed.success, "{passed:?}");
        assert_eq!(passed.confidence, Some(0.8));

        h.threshold = 0.9;
        let failed = h.run(&script(&[RESULT_BARE], 0), &invocation(&[]));
        assert_eq!(failed.failure, Some(FailureKind::LowConfidence));
        assert_eq!(failed.detail, "confidence 0.80 below threshold 0.90");
    }

    /// Verifies that a stop pattern ends the step successfully and terminates
    /// the process without waiting for it to finish. The `sleep` runs as a
    /// child of `sh` and holds stdout open.
    #[test]
    fn stop_pattern_terminates_agent() {
        let mut h = Harness::new();
        let started = Instant::now();
        let script = format!("echo '{ASSISTANT}'; sleep 30; true");
        let result = h.run(&script, &invocation(&["phase\\s+done"]));
        assert!(result.success);
        assert_eq!(
            result.reason,
            StepReason::StopPatternMatched {
                pattern: "phase\\s+done".to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn stop_is_bounded_by_grace_when_children_hold_stdout() {
        let mut h = Harness::new();
        h.stop_grace = Duration::from_millis(500);
        let controller = h.mailbox.controller();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            controller.stop();
        });
        let started = Instant::now();
        let script = format!("echo '{ASSISTANT}'; sleep 8; true");
        let result = h.run(&script, &invocation(&[]));
        stopper.join().expect("join");
        let took = started.elapsed();
        assert!(result.is_stop_requested(), "{result:?}");
        assert!(took < Duration::from_secs(4), "stop took {took:?}");
    }

    #[test]
    fn stop_signal_mid_stream_is_not_a_failure() {
        let mut h = Harness::new();
        let controller = h.mailbox.controller();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            controller.stop();
        });
        let script = format!("echo '{ASSISTANT}'; exec sleep 30");
        let result = h.run(&script, &invocation(&[]));
        stopper.join().expect("join");
        assert!(result.success);
        assert!(result.is_stop_requested());
        assert!(h.mailbox.stop_requested());
    }

    #[test]
    fn spawn_failure_is_a_process_error() {
        struct Missing;
        impl AgentBackend for Missing {
            fn command(&self, _request: &AgentRequest) -> Result<Command> {
                Ok(Command::new("/nonexistent/planloop-agent"))
            }
        }
        let mut h = Harness::new();
        let result = SessionDriver {
            backend: &Missing,
            mailbox: &mut h.mailbox,
            session: &mut h.session,
            events: &mut h.events,
            confidence_threshold: 0.8,
            stop_grace: Duration::from_secs(1),
        }
        .run(&invocation(&[]));
        assert_eq!(result.failure, Some(FailureKind::ProcessError));
        assert!(result.detail.contains("spawn agent process"), "{}", result.detail);
    }
}
