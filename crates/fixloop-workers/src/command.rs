//! External process execution shared by the command-backed workers

use crate::error::WorkerError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured output is cut to this many bytes per stream
const MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Exit code, if the process was not killed by a signal
    pub code: Option<i32>,
    /// Standard output (lossy UTF-8)
    pub stdout: String,
    /// Standard error (lossy UTF-8)
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout and stderr joined for diagnostics
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, _) => self.stderr.trim_end().to_string(),
        }
    }
}

/// Runs programs in a fixed working directory with a timeout
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    /// Runner rooted at `cwd`
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cwd: cwd.into(),
            timeout,
        }
    }

    /// Working directory
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run `program args...` to completion.
    ///
    /// A non-zero exit is returned as `Ok` with `success = false`.
    ///
    /// # Errors
    /// [`WorkerError::Invocation`] when the program cannot be started,
    /// [`WorkerError::Unavailable`] when it exceeds the timeout.
    pub async fn run<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput, WorkerError> {
        let rendered = render(program, args);
        tracing::debug!(cwd = %self.cwd.display(), command = %rendered, "running command");

        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(AsRef::as_ref))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let result = CommandOutput {
                    success: output.status.success(),
                    code: output.status.code(),
                    stdout: lossy(&output.stdout),
                    stderr: lossy(&output.stderr),
                };
                if !result.success {
                    tracing::debug!(command = %rendered, code = ?result.code, "command exited unsuccessfully");
                }
                Ok(result)
            }
            Ok(Err(e)) => Err(WorkerError::Invocation(format!("{rendered}: {e}"))),
            Err(_) => Err(WorkerError::Unavailable(format!(
                "{rendered}: timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Run and require success.
    ///
    /// # Errors
    /// As [`run`](Self::run), plus [`WorkerError::Invocation`] on non-zero exit.
    pub async fn run_ok<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput, WorkerError> {
        let output = self.run(program, args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(WorkerError::Invocation(format!(
                "{} failed: {}",
                render(program, args),
                output.combined()
            )))
        }
    }
}

fn render<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(AsRef::as_ref))
        .collect::<Vec<_>>()
        .join(" ")
}

fn lossy(bytes: &[u8]) -> String {
    let cut = &bytes[..bytes.len().min(MAX_OUTPUT_BYTES)];
    String::from_utf8_lossy(cut).into_owned()
}
