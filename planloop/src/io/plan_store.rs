//! Reading plan documents and locating the project they belong to.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::core::plan::{Plan, parse_plan};
use crate::error::EngineError;
use crate::io::git::Git;

/// Files that mark a project root when there is no git repository.
const PROJECT_MARKERS: [&str; 3] = ["Cargo.toml", "pyproject.toml", "package.json"];

/// Read and parse the plan at `path`.
pub fn load_plan(path: &Path) -> Result<Plan, EngineError> {
    let text = fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan = parse_plan(path, &text)?;
    debug!(
        phases = plan.phases.len(),
        completed = plan.progress().completed,
        "loaded plan"
    );
    Ok(plan)
}

/// Directory the agent and shell steps run in.
///
/// Explicit choice wins. Otherwise: the directory above a `thoughts/` folder
/// containing the plan, the git top-level, the nearest ancestor with a
/// project marker file, and finally the plan's own directory.
pub fn resolve_working_dir(plan_path: &Path, explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return dir
            .canonicalize()
            .with_context(|| format!("working directory {}", dir.display()));
    }
    let plan_dir = plan_path
        .canonicalize()
        .with_context(|| format!("plan {}", plan_path.display()))?
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("plan path has no parent directory"))?;

    if let Some(root) = above_thoughts(&plan_dir) {
        return Ok(root);
    }
    if let Some(top) = Git::toplevel(&plan_dir) {
        return Ok(top);
    }
    let marked = plan_dir
        .ancestors()
        .find(|dir| PROJECT_MARKERS.iter().any(|m| dir.join(m).is_file()));
    Ok(marked.map(Path::to_path_buf).unwrap_or(plan_dir))
}

fn above_thoughts(dir: &Path) -> Option<PathBuf> {
    let mut root = PathBuf::new();
    for component in dir.components() {
        if component == Component::Normal("thoughts".as_ref()) {
            return Some(root);
        }
        root.push(component);
    }
    None
}
