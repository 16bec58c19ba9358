//! Synchronous, fully captured execution of the hypervisor control tool.
//!
//! Every invocation spawns exactly one child, buffers its stdout and stderr
//! into anonymous temporary files and blocks until it exits. The result is a
//! plain [`ToolOutcome`]: an ordinary nonzero exit is a value, never a panic.

use std::io::{Read, Seek};
use std::process::{Command, ExitStatus};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Failure of a single control tool invocation.
#[derive(Debug, Error)]
pub(crate) enum ToolError {
    /// The executable is missing or cannot be executed.
    #[error("The supplied tool, \"{path}\", cannot be executed")]
    Spawn {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output capture could not be set up or read back.
    #[error("Failed to capture the output of \"{path}\"")]
    Capture {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but exited nonzero or was killed by a signal.
    #[error("Subprocess failed: {status}\n{stderr}")]
    Execution {
        status: String,
        stdout: String,
        stderr: String,
    },
}

impl ToolError {
    /// Captured stderr of a tool that ran, if any.
    pub(crate) fn stderr(&self) -> Option<&str> {
        match self {
            ToolError::Execution { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Stdout of a successful run, or the reason it was not successful.
pub(crate) type ToolOutcome = Result<String, ToolError>;

/// A backend able to run the control tool to completion.
///
/// The real implementation is [`SubprocessRunner`]; tests substitute a
/// scripted runner so no hypervisor is required.
pub(crate) trait ToolRunner {
    fn invoke(&self, executable: &Utf8Path, args: &[&str]) -> ToolOutcome;
}

/// Runs the control tool as a real child process.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SubprocessRunner;

impl ToolRunner for SubprocessRunner {
    fn invoke(&self, executable: &Utf8Path, args: &[&str]) -> ToolOutcome {
        let mut cmd = Command::new(executable);
        cmd.args(args);
        cmd.run_captured(executable)
    }
}

/// Helpers intended for [`std::process::Command`].
trait CommandRun {
    /// Execute the child, capturing both output streams.
    fn run_captured(&mut self, executable: &Utf8Path) -> ToolOutcome;
}

impl CommandRun for Command {
    fn run_captured(&mut self, executable: &Utf8Path) -> ToolOutcome {
        let capture = |source| ToolError::Capture {
            path: executable.to_owned(),
            source,
        };
        let stdout = tempfile::tempfile().map_err(capture)?;
        let stderr = tempfile::tempfile().map_err(capture)?;
        self.stdout(stdout.try_clone().map_err(capture)?);
        self.stderr(stderr.try_clone().map_err(capture)?);
        tracing::trace!("exec: {self:?}");

        let status = self.status().map_err(|source| ToolError::Spawn {
            path: executable.to_owned(),
            source,
        })?;
        let out = read_all_utf8(stdout).map_err(capture)?;
        outcome_from_status(status, out, last_utf8_content_from_file(stderr))
    }
}

/// Classify a finished child. Only a normal exit with status 0 succeeds.
fn outcome_from_status(status: ExitStatus, stdout: String, stderr: String) -> ToolOutcome {
    if status.success() {
        return Ok(stdout);
    }
    Err(ToolError::Execution {
        status: status.to_string(),
        stdout,
        stderr,
    })
}

fn read_all_utf8(mut f: std::fs::File) -> std::io::Result<String> {
    let mut buf = Vec::new();
    f.seek(std::io::SeekFrom::Start(0))?;
    f.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -i64::from(size);
    let mut stderr_buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}
