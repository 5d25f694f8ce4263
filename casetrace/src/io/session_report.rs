//! Session report storage (`.casetrace/session_report.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::final_status::{ItemReport, ReportTargets};

pub const DEFAULT_REPORT_PATH: &str = ".casetrace/session_report.json";

/// Persisted outcome of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionReport {
    pub project_key: Option<String>,
    pub test_plan_key: Option<String>,
    pub test_run_keys: Vec<String>,
    pub exit_code: i32,
    pub items: Vec<ItemReport>,
}

impl SessionReport {
    pub fn targets(&self) -> ReportTargets {
        ReportTargets {
            project_key: self.project_key.clone(),
            test_plan_key: self.test_plan_key.clone(),
            test_run_keys: self.test_run_keys.clone(),
        }
    }
}

/// Load a session report from disk.
pub fn load_session_report(path: &Path) -> Result<SessionReport> {
    debug!(path = %path.display(), "loading session report");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read session report {}", path.display()))?;
    let report: SessionReport = serde_json::from_str(&contents)
        .with_context(|| format!("parse session report {}", path.display()))?;
    debug!(items = report.items.len(), exit_code = report.exit_code, "session report loaded");
    Ok(report)
}

/// Atomically write a session report to disk (temp file + rename).
pub fn write_session_report(path: &Path, report: &SessionReport) -> Result<()> {
    debug!(path = %path.display(), items = report.items.len(), "writing session report");
    let mut buf = serde_json::to_string_pretty(report)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session report path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace session report {}", path.display()))?;
    Ok(())
}
