use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{Result, SandboxError};

/// Default bound for a single external command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Stderr fragments that mean the engine daemon itself is unreachable.
const DAEMON_UNAVAILABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
    "Cannot connect to Podman",
];

/// Whether engine stderr says the daemon itself could not be reached.
pub fn is_daemon_unavailable(stderr: &str) -> bool {
    DAEMON_UNAVAILABLE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// A builder for executing external commands with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<String>,
    workdir: Option<&'a Path>,
    timeout: Duration,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            workdir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Bound how long the command may run before it is killed
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn display(&self) -> String {
        format!("{} {}", self.command, self.args.join(" "))
    }

    async fn output(&self) -> Result<Output> {
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = self.command, args = ?self.args, workdir = ?workdir_display, "cmd:run start");

        let mut cmd = Command::new(self.command);
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SandboxError::EngineUnavailable(format!(
                "Failed to execute command: {}: {}",
                self.display(),
                e
            ))),
            Err(_) => {
                warn!(
                    command = self.command,
                    args = ?self.args,
                    timeout_secs = self.timeout.as_secs(),
                    "cmd:run timed out"
                );
                Err(SandboxError::EngineUnavailable(format!(
                    "Command timed out after {}s: {}",
                    self.timeout.as_secs(),
                    self.display()
                )))
            }
        }
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub async fn run(self) -> Result<Output> {
        let output = self.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(
                command = self.command,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr,
                "cmd:run failure"
            );
            if is_daemon_unavailable(&stderr) {
                return Err(SandboxError::EngineUnavailable(stderr));
            }
            return Err(SandboxError::CommandFailed {
                command: self.display(),
                status: output.status.code(),
                stderr,
            });
        }
        trace!(command = self.command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return the output whatever the exit status.
    /// Spawn failures and timeouts still surface as errors.
    pub async fn run_allow_failure(self) -> Result<Output> {
        let output = self.output().await?;
        trace!(command = self.command, status = ?output.status.code(), "cmd:run finished");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub async fn run_and_capture_stdout(self) -> Result<String> {
        Ok(self.run_and_capture_raw_stdout().await?.trim().to_string())
    }

    /// Execute the command and return stdout exactly as produced
    pub async fn run_and_capture_raw_stdout(self) -> Result<String> {
        let command = self.display();
        let output = self.run().await?;
        String::from_utf8(output.stdout)
            .map_err(|e| SandboxError::MalformedOutput(format!("{}: {}", command, e)))
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    /// Spawn failures and timeouts still surface as errors.
    pub async fn run_as_check(self) -> Result<bool> {
        let output = self.output().await?;
        let success = output.status.success();
        trace!(command = self.command, success, "cmd:check result");
        Ok(success)
    }
}
