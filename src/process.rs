//! Process execution gateway.
//!
//! Every backend handler reaches its external tool (podman, docker,
//! machinectl, pct, ssh, scp) through this single chokepoint. The gateway
//! spawns the executable **directly with an argument vector** — never via
//! a shell — so interpolated values cannot inject commands. Stdout and
//! stderr are accumulated incrementally while a timer enforces the
//! timeout: SIGTERM first, SIGKILL after a grace period.
//!
//! The gateway never decides whether a nonzero exit code is a business
//! failure or a system fault. That judgment belongs to the calling
//! handler operation: lifecycle calls throw on nonzero, script execution
//! returns it as data.
//!
//! [`ProcessGateway`] is the seam for tests: handlers hold an
//! `Arc<dyn ProcessGateway>` and integration tests substitute a recording
//! mock so no real backend tool is spawned.

use crate::constants::{DEFAULT_TIMEOUT_MS, SIGTERM_GRACE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// One external process invocation: executable, argument vector, and
/// supervision options.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Executable name or path, resolved via `PATH` by the OS.
    pub program: String,
    /// Argument vector, passed through without shell interpretation.
    pub args: Vec<String>,
    /// Wall-clock budget before forced termination.
    pub timeout: Duration,
    /// Text written to the child's stdin, then closed.
    pub stdin: Option<String>,
    /// Fold captured stderr into stdout in the result.
    pub combine_stderr: bool,
}

impl ExecSpec {
    /// Builds a spec with the default timeout and no stdin.
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(program: &str, args: I) -> Self {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stdin: None,
            combine_stderr: false,
        }
    }

    /// Overrides the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Supplies stdin text.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Folds stderr into stdout in the result.
    pub fn combining_stderr(mut self) -> Self {
        self.combine_stderr = true;
        self
    }
}

/// Structured outcome of one external process invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    /// Exit code; `-1` if the process was killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// True if the timeout fired and the process was terminated.
    pub timed_out: bool,
}

impl ProcessResult {
    /// True if the process exited zero within its time budget.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// The single seam between handlers and the operating system.
#[async_trait]
pub trait ProcessGateway: Send + Sync {
    /// Runs one external process to completion (or timeout) and returns
    /// its structured result.
    ///
    /// A timed-out process yields `Ok` with `timed_out = true`; only a
    /// failure to spawn or to collect output yields `Err`.
    async fn execute(&self, spec: ExecSpec) -> Result<ProcessResult>;
}

/// Production gateway over [`tokio::process::Command`].
#[derive(Debug, Default)]
pub struct SystemGateway;

impl SystemGateway {
    /// Creates the production gateway.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessGateway for SystemGateway {
    async fn execute(&self, spec: ExecSpec) -> Result<ProcessResult> {
        debug!(program = %spec.program, args = ?spec.args, "spawning external process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                // Dropping the handle closes the pipe so the child sees EOF.
            }
        }

        // Drain both pipes concurrently while waiting on the child, so a
        // chatty process cannot deadlock on a full pipe buffer.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(drain(stdout_pipe));
        let stderr_task = tokio::spawn(drain(stderr_pipe));

        let (status, timed_out) = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => (status?, false),
            Err(_) => {
                warn!(
                    program = %spec.program,
                    timeout_ms = spec.timeout.as_millis() as u64,
                    "process timed out, sending SIGTERM"
                );
                send_sigterm(&mut child);
                match tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
                    Ok(status) => (status?, true),
                    Err(_) => {
                        warn!(program = %spec.program, "SIGTERM ignored, escalating to SIGKILL");
                        child.start_kill().ok();
                        (child.wait().await?, true)
                    }
                }
            }
        };

        let mut stdout = stdout_task
            .await
            .map_err(|e| Error::Internal(format!("stdout reader panicked: {}", e)))?;
        let mut stderr = stderr_task
            .await
            .map_err(|e| Error::Internal(format!("stderr reader panicked: {}", e)))?;

        if spec.combine_stderr {
            stdout.push_str(&stderr);
            stderr.clear();
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(program = %spec.program, exit_code, timed_out, "process exited");

        Ok(ProcessResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

async fn drain<R: AsyncReadExt + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = pipe {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a PID we just obtained from a live child
        // handle. Worst case the process already exited and kill returns
        // ESRCH, which is harmless here.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    // No SIGTERM on this platform; go straight to forced termination.
    child.start_kill().ok();
}
