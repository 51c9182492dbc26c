//! Error taxonomy for a planloop run.
//!
//! Plan and workflow problems surface before any subprocess is spawned.
//! Step-level failures (`FailureKind`) are normally recorded and skipped over;
//! they only become an [`EngineError::StepFailure`] when the step sets
//! `require_success`. A user stop is not an error at all.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Malformed plan or workflow document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no `Phase <N>: <title>` heading found in {}", path.display())]
    NoPhases { path: PathBuf },

    #[error("invalid workflow {source_name}: {message}")]
    Workflow {
        source_name: String,
        message: String,
    },
}

/// A `{token}` in a step template that has no value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("step `{step}` references unknown variable `{{{token}}}`")]
pub struct TemplateError {
    pub step: String,
    pub token: String,
}

/// Why a dispatched step did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The subprocess failed to start, exited nonzero, or reported an error.
    ProcessError,
    /// The agent reported a confidence below the configured threshold.
    LowConfidence,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessError => f.write_str("process error"),
            Self::LowConfidence => f.write_str("low confidence"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("required step `{step}` failed ({kind}): {detail}")]
    StepFailure {
        step: String,
        kind: FailureKind,
        detail: String,
    },

    #[error("stopped after {0} phase iterations without finishing the plan")]
    IterationLimit(usize),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
