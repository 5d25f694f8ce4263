//! Git lookups used for CI traceability.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::io::process::run_with_timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper for read-only git queries in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// `git config --get remote.origin.url`, or `None` when unset.
    #[instrument(skip_all)]
    pub fn remote_origin_url(&self) -> Result<Option<String>> {
        let out = self.query(&["config", "--get", "remote.origin.url"])?;
        debug!(url = ?out, "remote origin url");
        Ok(out)
    }

    /// Run a query; a failing or timed out command yields `None`.
    fn query(&self, args: &[&str]) -> Result<Option<String>> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_with_timeout(cmd, GIT_TIMEOUT)?;
        if !output.success() {
            return Ok(None);
        }
        let value = output.stdout.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }
}
