//! JSONL run log under `.planloop/logs/`.
//!
//! One JSON object per engine event, timestamped. This is the product record
//! of a run; `tracing` output stays a developer diagnostic.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use serde::Serialize;

use crate::events::{EngineEvent, Renderer};
use crate::io::config::project_dir;

#[derive(Serialize)]
struct LogLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a EngineEvent,
}

pub struct JsonlRunLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlRunLog {
    /// Create `<working_dir>/.planloop/logs/<timestamp>_<plan stem>.jsonl`.
    pub fn create(working_dir: &Path, plan_path: &Path) -> Result<Self> {
        let dir = project_dir(working_dir).join("logs");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let stem = plan_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".to_string());
        let name = format!("{}_{stem}.jsonl", Local::now().format("%Y%m%d_%H%M%S"));
        Self::open(&dir.join(name))
    }

    fn open(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Renderer for JsonlRunLog {
    fn render(&mut self, event: &EngineEvent) -> Result<()> {
        let line = LogLine {
            ts: Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            event,
        };
        serde_json::to_writer(&mut self.writer, &line).context("serialize run log line")?;
        self.writer.write_all(b"\n").context("write run log")?;
        // Step results and phase boundaries are flushed so a crash loses at most live text.
        if !matches!(
            event,
            EngineEvent::TextDelta { .. } | EngineEvent::ToolCall { .. }
        ) {
            self.writer.flush().context("flush run log")?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("flush run log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_tagged_object_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut log = JsonlRunLog::create(temp.path(), Path::new("docs/PLAN.md")).expect("create");
        let path = log.path().to_path_buf();
        assert!(path.starts_with(temp.path().join(".planloop/logs")));
        assert!(path.to_string_lossy().ends_with("_PLAN.jsonl"));

        log.render(&EngineEvent::PauseChanged { paused: true })
            .expect("render");
        log.render(&EngineEvent::Warning {
            message: "context limit reached".to_string(),
        })
        .expect("render");
        log.finish().expect("finish");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "pause_changed");
        assert_eq!(lines[0]["paused"], true);
        assert!(lines[0]["ts"].is_string());
        assert_eq!(lines[1]["message"], "context limit reached");
    }
}
