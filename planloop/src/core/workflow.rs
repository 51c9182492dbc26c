//! Workflow definitions: the ordered steps applied to every plan phase.
//!
//! A [`WorkflowDefinition`] is the serde shape of a YAML/TOML document.
//! [`Workflow::from_definition`] validates it once and produces the typed,
//! immutable form the engine runs (stop patterns compiled, step kinds checked).

use std::collections::{BTreeMap, HashSet};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::core::template;
use crate::error::ParseError;

pub const DEFAULT_WORKFLOW_YAML: &str = include_str!("../../workflows/default.yaml");

/// Format of a workflow document on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Yaml,
    Toml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    #[serde(alias = "claude")]
    Agent,
    Shell,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub first_phase_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub require_success: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_if_clean: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

/// Built-in actions for `internal` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalAction {
    /// Reset the context meter and drop the agent session id.
    ClearSession,
    /// Report the working tree's changed files.
    ShowChanges,
}

impl InternalAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "clear_session" => Some(Self::ClearSession),
            "show_changes" => Some(Self::ShowChanges),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClearSession => "clear_session",
            Self::ShowChanges => "show_changes",
        }
    }
}

/// A compiled `stop_on` pattern. Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct StopPattern {
    pub source: String,
    regex: Regex,
}

impl StopPattern {
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

#[derive(Debug, Clone)]
pub enum StepAction {
    Agent {
        prompt: String,
        stop_on: Vec<StopPattern>,
        allowed_tools: Option<Vec<String>>,
    },
    Shell {
        commands: Vec<String>,
        skip_if_clean: bool,
    },
    Internal(InternalAction),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub first_phase_only: bool,
    pub require_success: bool,
    pub stream: bool,
    pub action: StepAction,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self.action {
            StepAction::Agent { .. } => StepKind::Agent,
            StepAction::Shell { .. } => StepKind::Shell,
            StepAction::Internal(_) => StepKind::Internal,
        }
    }

    /// Every template string of the step (prompt or commands).
    pub fn templates(&self) -> Vec<&str> {
        match &self.action {
            StepAction::Agent { prompt, .. } => vec![prompt.as_str()],
            StepAction::Shell { commands, .. } => commands.iter().map(String::as_str).collect(),
            StepAction::Internal(_) => Vec::new(),
        }
    }
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Shell => "shell",
            Self::Internal => "internal",
        }
    }
}

/// A validated workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub definition: WorkflowDefinition,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.definition.variables
    }

    /// Validate `definition`, naming `source_name` in any error.
    pub fn from_definition(
        source_name: &str,
        definition: WorkflowDefinition,
    ) -> Result<Self, ParseError> {
        let invalid = |message: String| ParseError::Workflow {
            source_name: source_name.to_string(),
            message,
        };
        if definition.name.trim().is_empty() {
            return Err(invalid("workflow name must not be empty".to_string()));
        }
        if definition.steps.is_empty() {
            return Err(invalid("workflow must define at least one step".to_string()));
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(definition.steps.len());
        for def in &definition.steps {
            if def.name.trim().is_empty() {
                return Err(invalid("step name must not be empty".to_string()));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(invalid(format!("duplicate step name `{}`", def.name)));
            }
            steps.push(compile_step(def).map_err(|msg| invalid(format!("step `{}`: {msg}", def.name)))?);
        }

        Ok(Self { definition, steps })
    }

    /// `(step, token)` pairs for every template token the workflow references.
    pub fn template_tokens(&self) -> Vec<(&str, String)> {
        self.steps
            .iter()
            .flat_map(|step| {
                step.templates()
                    .into_iter()
                    .flat_map(template::tokens)
                    .map(move |token| (step.name.as_str(), token))
            })
            .collect()
    }
}

fn compile_step(def: &StepDefinition) -> Result<Step, String> {
    if def.skip_if_clean && def.kind != StepKind::Shell {
        return Err("skip_if_clean is only valid on shell steps".to_string());
    }
    if !def.stop_on.is_empty() && def.kind != StepKind::Agent {
        return Err("stop_on is only valid on agent steps".to_string());
    }

    let action = match def.kind {
        StepKind::Agent => {
            let prompt = def
                .prompt
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or("agent step requires a non-empty `prompt`")?;
            let stop_on = def
                .stop_on
                .iter()
                .map(|source| compile_stop_pattern(source))
                .collect::<Result<Vec<_>, _>>()?;
            StepAction::Agent {
                prompt: prompt.to_string(),
                stop_on,
                allowed_tools: def.allowed_tools.clone(),
            }
        }
        StepKind::Shell => {
            if def.commands.is_empty() || def.commands.iter().any(|c| c.trim().is_empty()) {
                return Err("shell step requires non-empty `commands`".to_string());
            }
            StepAction::Shell {
                commands: def.commands.clone(),
                skip_if_clean: def.skip_if_clean,
            }
        }
        StepKind::Internal => {
            let raw = def.action.as_deref().unwrap_or_default();
            let action = InternalAction::parse(raw)
                .ok_or_else(|| format!("unknown internal action `{raw}`"))?;
            StepAction::Internal(action)
        }
    };

    Ok(Step {
        name: def.name.clone(),
        first_phase_only: def.first_phase_only,
        require_success: def.require_success,
        stream: def.stream,
        action,
    })
}

fn compile_stop_pattern(source: &str) -> Result<StopPattern, String> {
    let regex = RegexBuilder::new(source)
        .case_insensitive(true)
        .build()
        .map_err(|err| format!("invalid stop_on pattern `{source}`: {err}"))?;
    Ok(StopPattern {
        source: source.to_string(),
        regex,
    })
}

/// Parse and validate a workflow document.
pub fn parse_workflow(
    source_name: &str,
    text: &str,
    format: WorkflowFormat,
) -> Result<Workflow, ParseError> {
    let definition: WorkflowDefinition = match format {
        WorkflowFormat::Yaml => serde_yaml::from_str(text).map_err(|err| err.to_string()),
        WorkflowFormat::Toml => toml::from_str(text).map_err(|err| err.to_string()),
    }
    .map_err(|message| ParseError::Workflow {
        source_name: source_name.to_string(),
        message,
    })?;
    Workflow::from_definition(source_name, definition)
}

/// The built-in workflow used when no workflow file is found.
pub fn default_workflow() -> Result<Workflow, ParseError> {
    parse_workflow("built-in default", DEFAULT_WORKFLOW_YAML, WorkflowFormat::Yaml)
}

/// Serialize a definition back to YAML for display.
pub fn to_yaml(definition: &WorkflowDefinition) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(definition)
}
