//! Shared result and state types for engine orchestration.

use std::time::Duration;

use serde::Serialize;

use crate::core::plan::Progress;
use crate::error::FailureKind;

/// Why a step ended the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StepReason {
    Completed,
    StopPatternMatched { pattern: String },
    SkippedClean,
    SkippedFirstPhaseOnly,
    StopRequested,
    Failed,
}

/// Outcome of one dispatched (or skipped) step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub step: String,
    pub success: bool,
    #[serde(flatten)]
    pub reason: StepReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Human-readable detail: agent result text, failing command, stderr tail.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ExecutionResult {
    pub fn succeeded(step: &str, reason: StepReason, duration: Duration) -> Self {
        Self {
            step: step.to_string(),
            success: true,
            reason,
            failure: None,
            detail: String::new(),
            duration_ms: duration_ms(duration),
            confidence: None,
        }
    }

    pub fn failed(step: &str, kind: FailureKind, detail: String, duration: Duration) -> Self {
        Self {
            step: step.to_string(),
            success: false,
            reason: StepReason::Failed,
            failure: Some(kind),
            detail,
            duration_ms: duration_ms(duration),
            confidence: None,
        }
    }

    /// A step that ended because the user asked the run to stop. Not a failure.
    pub fn stop_requested(step: &str, duration: Duration) -> Self {
        Self::succeeded(step, StepReason::StopRequested, duration)
    }

    pub fn skipped(step: &str, reason: StepReason) -> Self {
        Self::succeeded(step, reason, Duration::ZERO)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn is_stop_requested(&self) -> bool {
        self.reason == StepReason::StopRequested
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Engine state machine position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    PhaseLoop { iteration: usize },
    StepLoop { iteration: usize, step: usize },
    Paused { iteration: usize, step: usize },
    Completed,
    Failed,
    Stopped,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { progress: Progress, iterations: usize },
    Stopped { progress: Progress, iterations: usize },
}

/// One `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}
