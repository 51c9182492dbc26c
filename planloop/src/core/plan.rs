//! Markdown plan parsing.
//!
//! A plan is a markdown document with one heading per phase
//! (`## Phase 2: Storage layer`). Each phase carries a status, read from the
//! first source that provides one:
//!
//! 1. a `Status:` field inside the phase block;
//! 2. a parenthesised status at the end of the heading (`(Complete)`);
//! 3. a row of a progress table (`| Phase 2 | ... | COMPLETE |`);
//! 4. otherwise the phase is pending.
//!
//! Parsing is a pure function of the text: no I/O, no mutation of the source.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::ParseError;

static PHASE_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(#{1,6})\s*phase\s*(\d+)\s*[:.\-]?\s*(.*?)\s*#*\s*$")
        .expect("phase heading regex")
});
static ANY_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s").expect("heading regex"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+(.+?)\s*$").expect("title regex"));
static HEADING_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)\s*\(([^)]+)\)$").expect("heading status regex"));
static STATUS_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*+]\s+)?[*_]*\s*status\s*[*_]*\s*:\s*[*_]*\s*(.+?)\s*$")
        .expect("status field regex")
});
static TABLE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*\|\s*[*_]*\s*phase\s*(\d+)\b[^|]*\|(.*)\|\s*$").expect("table row regex")
});
static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(?:\[[ xX]\]\s+)?(.+?)\s*$").expect("list item regex")
});
static CRITERIA_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s*)?[*_]*\s*(?:success\s*criteria|verification)\b")
        .expect("criteria label regex")
});
static SUMMARY_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#{2,6}\s*(quick\s*start|summary|overview)\b").expect("summary heading regex")
});
static MANUAL_CHECK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)manual\s*verification|verify\s*manually|human\s*review")
        .expect("manual check regex")
});

/// Normalized phase state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Complete,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        }
    }
}

/// A list item from a phase block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub text: String,
    /// The item asks for a human check ("manual verification", "human review").
    pub manual_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Phase {
    /// 1-based position in document order.
    pub index: usize,
    /// Number as written in the heading.
    pub number: u32,
    pub title: String,
    pub status: PhaseStatus,
    pub steps: Vec<PlanStep>,
    pub success_criteria: Vec<String>,
}

impl Phase {
    pub fn is_complete(&self) -> bool {
        self.status == PhaseStatus::Complete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed * 100) / self.total) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub path: PathBuf,
    pub title: String,
    /// Body of the "Quick Start" / "Summary" / "Overview" section, if any.
    pub summary: Option<String>,
    pub phases: Vec<Phase>,
}

impl Plan {
    /// Lowest-index phase that is not complete. `None` means the plan is done.
    pub fn next_incomplete_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|phase| !phase.is_complete())
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.phases.iter().filter(|p| p.is_complete()).count(),
            total: self.phases.len(),
        }
    }

    pub fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

struct PhaseHeading {
    line: usize,
    level: usize,
    number: u32,
    title: String,
    status: Option<PhaseStatus>,
}

/// Parse plan text into a [`Plan`].
///
/// Fails with [`ParseError::NoPhases`] when the document has no phase heading.
pub fn parse_plan(path: &Path, text: &str) -> Result<Plan, ParseError> {
    let lines = visible_lines(text);
    let headings = phase_headings(&lines);
    if headings.is_empty() {
        return Err(ParseError::NoPhases {
            path: path.to_path_buf(),
        });
    }

    let table = table_statuses(&lines);
    let mut phases = Vec::with_capacity(headings.len());
    for (pos, heading) in headings.iter().enumerate() {
        let end = block_end(&lines, heading.line, heading.level);
        let block = &lines[heading.line + 1..end];
        let status = field_status(block)
            .or(heading.status)
            .or_else(|| table.get(&heading.number).copied())
            .unwrap_or(PhaseStatus::Pending);
        let (steps, success_criteria) = block_items(block);
        phases.push(Phase {
            index: pos + 1,
            number: heading.number,
            title: heading.title.clone(),
            status,
            steps,
            success_criteria,
        });
    }

    Ok(Plan {
        path: path.to_path_buf(),
        title: plan_title(&lines),
        summary: plan_summary(&lines),
        phases,
    })
}

/// Map free-form status text to a [`PhaseStatus`].
///
/// Case, whitespace, markdown emphasis, and `_`/`-` separators are ignored.
/// Unrecognized text is pending.
pub fn normalize_status(raw: &str) -> PhaseStatus {
    recognize_status(raw).unwrap_or(PhaseStatus::Pending)
}

fn recognize_status(raw: &str) -> Option<PhaseStatus> {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '_' | '-' => ' ',
            c if c.is_alphanumeric() || c.is_whitespace() => c.to_ascii_lowercase(),
            _ => ' ',
        })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    match words.as_slice() {
        ["complete" | "completed" | "done" | "finished", ..] => Some(PhaseStatus::Complete),
        ["in", "progress", ..] | ["inprogress" | "wip" | "started" | "ongoing", ..] => {
            Some(PhaseStatus::InProgress)
        }
        [
            "pending" | "todo" | "not" | "incomplete" | "failed" | "blocked" | "skipped"
            | "planned",
            ..,
        ] => Some(PhaseStatus::Pending),
        _ => None,
    }
}

/// Lines with fenced code blocks blanked out so their contents are never
/// mistaken for headings or fields.
fn visible_lines(text: &str) -> Vec<&str> {
    let mut in_fence = false;
    text.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return "";
            }
            if in_fence { "" } else { line }
        })
        .collect()
}

fn phase_headings(lines: &[&str]) -> Vec<PhaseHeading> {
    let mut headings = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = PHASE_HEADING_RE.captures(line) else {
            continue;
        };
        let Ok(number) = caps[2].parse::<u32>() else {
            continue;
        };
        let raw_title = caps[3].trim();
        let (title, status) = match HEADING_STATUS_RE.captures(raw_title) {
            Some(inner) => match recognize_status(&inner[2]) {
                Some(status) => (inner[1].trim().to_string(), Some(status)),
                None => (raw_title.to_string(), None),
            },
            None => (raw_title.to_string(), None),
        };
        headings.push(PhaseHeading {
            line: idx,
            level: caps[1].len(),
            number,
            title,
            status,
        });
    }
    headings
}

/// Index one past the last line of the block opened by the heading at `start`.
fn block_end(lines: &[&str], start: usize, level: usize) -> usize {
    lines
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, line)| {
            ANY_HEADING_RE
                .captures(line)
                .is_some_and(|caps| caps[1].len() <= level)
        })
        .map(|(idx, _)| idx)
        .unwrap_or(lines.len())
}

fn field_status(block: &[&str]) -> Option<PhaseStatus> {
    block
        .iter()
        .find_map(|line| STATUS_FIELD_RE.captures(line))
        .map(|caps| normalize_status(&caps[1]))
}

fn table_statuses(lines: &[&str]) -> BTreeMap<u32, PhaseStatus> {
    let mut statuses = BTreeMap::new();
    for line in lines {
        let Some(caps) = TABLE_ROW_RE.captures(line) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u32>() else {
            continue;
        };
        let status = caps[2]
            .split('|')
            .rev()
            .find_map(recognize_status)
            .unwrap_or(PhaseStatus::Pending);
        statuses.entry(number).or_insert(status);
    }
    statuses
}

fn block_items(block: &[&str]) -> (Vec<PlanStep>, Vec<String>) {
    let mut steps = Vec::new();
    let mut criteria = Vec::new();
    let mut seen = HashSet::new();
    let mut in_criteria = false;

    for line in block {
        if CRITERIA_LABEL_RE.is_match(line) && LIST_ITEM_RE.captures(line).is_none() {
            in_criteria = true;
            continue;
        }
        let Some(caps) = LIST_ITEM_RE.captures(line) else {
            if ANY_HEADING_RE.is_match(line) {
                in_criteria = false;
            }
            continue;
        };
        let text = caps[1].trim();
        if STATUS_FIELD_RE.is_match(line) {
            continue;
        }
        if in_criteria {
            criteria.push(text.to_string());
            continue;
        }
        if text.chars().count() > 5 && seen.insert(text.to_string()) {
            steps.push(PlanStep {
                text: text.to_string(),
                manual_check: MANUAL_CHECK_RE.is_match(text),
            });
        }
    }
    (steps, criteria)
}

fn plan_title(lines: &[&str]) -> String {
    lines
        .iter()
        .find_map(|line| TITLE_RE.captures(line))
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "Untitled Plan".to_string())
}

fn plan_summary(lines: &[&str]) -> Option<String> {
    let start = lines.iter().position(|line| SUMMARY_HEADING_RE.is_match(line))?;
    let body: Vec<&str> = lines[start + 1..]
        .iter()
        .take_while(|line| !ANY_HEADING_RE.is_match(line) && line.trim() != "---")
        .copied()
        .collect();
    let summary = body.join("\n").trim().to_string();
    (!summary.is_empty()).then_some(summary)
}
