//! `{token}` substitution for workflow step templates.
//!
//! Tokens are identifiers in single braces. `{{` and `}}` produce literal
//! braces. Braces around anything that is not an identifier (JSON, shell
//! `${VAR}` expansions and the like) pass through untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::TemplateError;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{[^}]*\}|\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("template token regex")
});

/// Variable values available to step templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    vars: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}

/// Names of every `{token}` referenced by `template`, in order of appearance.
pub fn tokens(template: &str) -> Vec<String> {
    TOKEN_RE
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// True if `template` references `{name}`.
pub fn references(template: &str, name: &str) -> bool {
    tokens(template).iter().any(|token| token == name)
}

/// Substitute every token in `template` from `ctx`.
///
/// The first unresolved token fails the render; nothing is partially rendered.
pub fn render(step: &str, template: &str, ctx: &RunContext) -> Result<String, TemplateError> {
    if let Some(missing) = tokens(template).into_iter().find(|t| !ctx.contains(t)) {
        return Err(TemplateError {
            step: step.to_string(),
            token: missing,
        });
    }
    let rendered = TOKEN_RE.replace_all(template, |caps: &Captures<'_>| match caps.get(1) {
        Some(name) => ctx.get(name.as_str()).unwrap_or_default().to_string(),
        None => match &caps[0] {
            "{{" => "{".to_string(),
            "}}" => "}".to_string(),
            shell_expansion => shell_expansion.to_string(),
        },
    });
    Ok(rendered.into_owned())
}
