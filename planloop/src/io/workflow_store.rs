//! Workflow discovery: explicit path, then project, then global, then built-in.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::workflow::{
    DEFAULT_WORKFLOW_YAML, Workflow, WorkflowFormat, default_workflow, parse_workflow,
};
use crate::io::config::{project_dir, write_atomic};

const FILE_STEM: &str = "workflow";
const EXTENSIONS: [&str; 3] = ["yaml", "yml", "toml"];

/// Where the active workflow came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSource {
    Explicit(PathBuf),
    Project(PathBuf),
    Global(PathBuf),
    BuiltIn,
}

impl std::fmt::Display for WorkflowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit(path) => write!(f, "{}", path.display()),
            Self::Project(path) => write!(f, "project ({})", path.display()),
            Self::Global(path) => write!(f, "global ({})", path.display()),
            Self::BuiltIn => f.write_str("built-in default"),
        }
    }
}

/// Directories searched for workflow files.
#[derive(Debug, Clone)]
pub struct WorkflowDirs {
    pub project: PathBuf,
    pub global: Option<PathBuf>,
}

impl WorkflowDirs {
    /// `<working_dir>/.planloop` and `<config_dir>/planloop`.
    pub fn for_working_dir(working_dir: &Path) -> Self {
        Self {
            project: project_dir(working_dir),
            global: dirs::config_dir().map(|dir| dir.join("planloop")),
        }
    }

    pub fn scope_dir(&self, global: bool) -> Result<&Path> {
        if global {
            self.global
                .as_deref()
                .ok_or_else(|| anyhow!("no global config directory on this platform"))
        } else {
            Ok(&self.project)
        }
    }
}

/// Resolve and load the workflow for a run.
pub fn load_workflow(
    explicit: Option<&Path>,
    dirs: &WorkflowDirs,
) -> Result<(Workflow, WorkflowSource)> {
    if let Some(path) = explicit {
        let workflow = read_workflow_file(path)?;
        return Ok((workflow, WorkflowSource::Explicit(path.to_path_buf())));
    }
    if let Some(path) = find_in(&dirs.project) {
        let workflow = read_workflow_file(&path)?;
        return Ok((workflow, WorkflowSource::Project(path)));
    }
    if let Some(path) = dirs.global.as_deref().and_then(find_in) {
        let workflow = read_workflow_file(&path)?;
        return Ok((workflow, WorkflowSource::Global(path)));
    }
    debug!("no workflow file found, using built-in default");
    Ok((default_workflow()?, WorkflowSource::BuiltIn))
}

/// First `workflow.{yaml,yml,toml}` present in `dir`.
pub fn find_in(dir: &Path) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{FILE_STEM}.{ext}")))
        .find(|path| path.is_file())
}

pub fn read_workflow_file(path: &Path) -> Result<Workflow> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => WorkflowFormat::Toml,
        _ => WorkflowFormat::Yaml,
    };
    Ok(parse_workflow(&path.display().to_string(), &text, format)?)
}

/// Write the built-in workflow to `dir/workflow.yaml`.
///
/// Refuses to replace an existing workflow file unless `force` is set.
pub fn init_workflow(dir: &Path, force: bool) -> Result<PathBuf> {
    if let Some(existing) = find_in(dir)
        && !force
    {
        return Err(anyhow!(
            "workflow already exists at {} (use --force to overwrite)",
            existing.display()
        ));
    }
    let path = dir.join(format!("{FILE_STEM}.yaml"));
    write_atomic(&path, DEFAULT_WORKFLOW_YAML)?;
    info!(path = %path.display(), "wrote default workflow");
    Ok(path)
}

/// Delete every workflow file in `dir`. Returns the removed paths.
pub fn reset_workflow(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for ext in EXTENSIONS {
        let path = dir.join(format!("{FILE_STEM}.{ext}"));
        if path.is_file() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            removed.push(path);
        }
    }
    Ok(removed)
}
