//! Child process execution for pipeline steps.
//!
//! This module runs external programs and shell commands with timeout
//! support, output capture, and error handling. Every child is spawned with
//! `kill_on_drop` and, on Unix, as the leader of its own process group, so
//! abandoning a step future terminates the child and everything it started.

use crate::core::error::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

/// Exit code reported for a child killed by the timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Whether the command was killed due to timeout.
    pub timed_out: bool,
    /// Duration the command took to run.
    pub duration: Duration,
}

impl CommandOutput {
    /// Returns true if the command succeeded (exit code 0).
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Returns combined stdout and stderr output.
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Returns the last `n` non-empty lines of combined output.
    #[must_use]
    pub fn tail(&self, n: usize) -> String {
        let combined = self.combined_output();
        let lines: Vec<&str> = combined.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Options for command execution.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Working directory for the command.
    pub cwd: Option<PathBuf>,
    /// Timeout for the command.
    pub timeout: Option<Duration>,
    /// Whether to capture output (vs streaming to console).
    pub capture_output: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: Some(Duration::from_secs(300)),
            capture_output: true,
        }
    }
}

impl ExecuteOptions {
    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, path: impl AsRef<Path>) -> Self {
        self.cwd = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Sets whether to capture output.
    #[must_use]
    pub const fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

/// Process group led by a spawned child. Dropping it kills the group.
#[derive(Debug)]
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self { leader: child.id() }
    }

    /// Sends `SIGKILL` to every process in the group.
    fn kill(&mut self) {
        let Some(pid) = self.leader.take() else {
            return;
        };
        kill_group(pid);
    }

    /// Forgets the group once the leader has exited on its own.
    fn disarm(&mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // A negative pid addresses the whole group
    if let Err(e) = signal::kill(Pid::from_raw(-pid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pid, error = %e, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Executor for running child processes.
#[derive(Debug, Default)]
pub struct Executor;

impl Executor {
    /// Creates a new executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Executes a shell command line.
    pub async fn execute(&self, command: &str, options: ExecuteOptions) -> Result<CommandOutput> {
        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg).arg(command);

        tracing::debug!(command = %command, "Executing shell command");
        self.run(cmd, &options).await
    }

    /// Executes a program directly with the given arguments, without a shell.
    pub async fn execute_program<I, S>(
        &self,
        program: &str,
        args: I,
        options: ExecuteOptions,
    ) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();

        let mut cmd = Command::new(program);
        cmd.args(&args);

        tracing::debug!(program = %program, args = ?args, "Executing program");
        self.run(cmd, &options).await
    }

    /// Spawns a prepared command and waits for it under the configured timeout.
    async fn run(&self, mut cmd: Command, options: &ExecuteOptions) -> Result<CommandOutput> {
        let start = std::time::Instant::now();

        if let Some(ref cwd) = options.cwd {
            cmd.current_dir(cwd);
        }

        // Children never read from us
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        if options.capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        let mut child = cmd.spawn().map_err(|e| Error::io("spawn command", e))?;
        let mut group = ProcessGroup::of(&child);

        let result = if let Some(timeout_duration) = options.timeout {
            match timeout(
                timeout_duration,
                self.wait_for_output(&mut child, options.capture_output),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    group.kill();
                    // Reap the leader; the group is already gone
                    drop(child.kill().await);
                    return Ok(CommandOutput {
                        exit_code: TIMEOUT_EXIT_CODE,
                        stdout: String::new(),
                        stderr: "Command timed out".to_string(),
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                },
            }
        } else {
            self.wait_for_output(&mut child, options.capture_output)
                .await
        };

        group.disarm();
        let (exit_code, stdout, stderr) = result?;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
            duration: start.elapsed(),
        })
    }

    /// Waits for the command to complete and captures output.
    async fn wait_for_output(
        &self,
        child: &mut tokio::process::Child,
        capture: bool,
    ) -> Result<(i32, String, String)> {
        if capture {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let stdout_handle = tokio::spawn(async move {
                let mut output = String::new();
                if let Some(stdout) = stdout {
                    let mut reader = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        output.push_str(&line);
                        output.push('\n');
                    }
                }
                output
            });

            let stderr_handle = tokio::spawn(async move {
                let mut output = String::new();
                if let Some(stderr) = stderr {
                    let mut reader = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        output.push_str(&line);
                        output.push('\n');
                    }
                }
                output
            });

            let status = child
                .wait()
                .await
                .map_err(|e| Error::io("wait for command", e))?;

            let stdout = stdout_handle.await.map_err(|e| Error::Internal {
                message: format!("stdout task failed: {e}"),
            })?;
            let stderr = stderr_handle.await.map_err(|e| Error::Internal {
                message: format!("stderr task failed: {e}"),
            })?;

            Ok((status.code().unwrap_or(1), stdout, stderr))
        } else {
            let status = child
                .wait()
                .await
                .map_err(|e| Error::io("wait for command", e))?;
            Ok((status.code().unwrap_or(1), String::new(), String::new()))
        }
    }

    /// Checks if a command exists in PATH.
    #[must_use]
    pub fn command_exists(command: &str) -> bool {
        which::which(command).is_ok()
    }
}
