//! Helpers for running short-lived child processes with a timeout.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Run a command with a timeout and capture its stdout.
///
/// Stdout is drained on a separate thread so a chatty child cannot block on a
/// full pipe. Stderr is discarded. A child still running at the deadline is killed.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let reader = thread::spawn(move || -> std::io::Result<String> {
        let mut buf = String::new();
        stdout.read_to_string(&mut buf)?;
        Ok(buf)
    });

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = match reader.join() {
        Ok(result) => result.context("read stdout")?,
        Err(_) => return Err(anyhow!("output reader thread panicked")),
    };

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        timed_out,
    })
}
