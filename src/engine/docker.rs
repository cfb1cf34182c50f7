//! Docker/Podman CLI implementation of the engine boundary.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Engine, EngineRow, ExecOutput, RunSpec, parse_rows};
use crate::cmd::{Cmd, is_daemon_unavailable};
use crate::config::{Config, SandboxRuntime};
use crate::error::{Result, SandboxError};

/// First delay between attempts when the engine is unreachable; doubles each time.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Stderr fragments meaning the referenced instance does not exist.
const MISSING_INSTANCE_MARKERS: &[&str] = &[
    "No such container",
    "No such object",
    "no such container",
];

/// Container engine driven through the `docker` or `podman` CLI.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    runtime: SandboxRuntime,
    command_timeout: Duration,
    build_timeout: Duration,
    attempts: u32,
}

impl DockerEngine {
    pub fn new(runtime: SandboxRuntime) -> Self {
        Self {
            runtime,
            command_timeout: crate::cmd::DEFAULT_TIMEOUT,
            build_timeout: Duration::from_secs(900),
            attempts: 3,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            runtime: config.runtime(),
            command_timeout: config.command_timeout(),
            build_timeout: config.build_timeout(),
            attempts: config.retry_attempts(),
        }
    }

    fn bin(&self) -> &'static str {
        self.runtime.binary()
    }

    fn cmd(&self) -> Cmd<'static> {
        Cmd::new(self.bin()).timeout(self.command_timeout)
    }

    /// Retry `op` with exponential backoff, but only while the engine is
    /// unreachable. Every other failure is returned immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "engine:retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Turn "no such container" failures into `NotFound`.
fn map_missing(err: SandboxError, id: &str) -> SandboxError {
    match &err {
        SandboxError::CommandFailed { stderr, .. }
            if MISSING_INSTANCE_MARKERS.iter().any(|m| stderr.contains(m)) =>
        {
            SandboxError::NotFound(format!("sandbox {}", id))
        }
        _ => err,
    }
}

/// Build the argument list for `run`, kept separate so it can be tested
/// without an engine.
pub(crate) fn build_run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "-p".to_string(),
        format!("{}:{}", spec.host_port, spec.app_port),
        "--mount".to_string(),
        format!(
            "type=bind,source={},target={}",
            spec.mount_source.display(),
            spec.mount_target
        ),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &'static str {
        self.bin()
    }

    async fn ping(&self) -> Result<bool> {
        self.cmd()
            .args(["info", "--format", "{{.ServerVersion}}"])
            .run_as_check()
            .await
    }

    async fn build(&self, context: &Path, tag: &str) -> Result<String> {
        info!(image = tag, runtime = self.bin(), "engine:build start");
        let output = self
            .with_retry("build", || {
                Cmd::new(self.bin())
                    .timeout(self.build_timeout)
                    .args(["build", "-t", tag, "--rm", "--force-rm", "."])
                    .workdir(context)
                    .run()
            })
            .await?;
        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(image = tag, bytes = captured.len(), "engine:build done");
        Ok(captured)
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        // Not retried: a run that timed out may still have created the instance.
        let id = self
            .cmd()
            .args(build_run_args(spec))
            .run_and_capture_stdout()
            .await?;
        if id.is_empty() {
            return Err(SandboxError::MalformedOutput(format!(
                "{} run returned no instance id for {}",
                self.bin(),
                spec.name
            )));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.with_retry("start", || self.cmd().args(["start", id]).run())
            .await
            .map_err(|e| map_missing(e, id))?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.with_retry("stop", || self.cmd().args(["stop", id]).run())
            .await
            .map_err(|e| map_missing(e, id))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.with_retry("remove", || self.cmd().args(["rm", id]).run())
            .await
            .map_err(|e| map_missing(e, id))?;
        Ok(())
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<EngineRow>> {
        let filter = format!("label={}", label_filter);
        let stdout = self
            .with_retry("list", || {
                self.cmd()
                    .args([
                        "ps",
                        "-a",
                        "--no-trunc",
                        "--filter",
                        filter.as_str(),
                        "--format",
                        "{{json .}}",
                    ])
                    .run_and_capture_raw_stdout()
            })
            .await?;
        Ok(parse_rows(&stdout))
    }

    async fn inspect_labels(&self, id: &str) -> Result<BTreeMap<String, String>> {
        let stdout = self
            .with_retry("inspect", || {
                self.cmd()
                    .args(["inspect", "--format", "{{json .Config.Labels}}", id])
                    .run_and_capture_stdout()
            })
            .await
            .map_err(|e| map_missing(e, id))?;
        if stdout.is_empty() || stdout == "null" {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&stdout)
            .map_err(|e| SandboxError::MalformedOutput(format!("labels of {}: {}", id, e)))
    }

    async fn copy_in(&self, src: &Path, id: &str, dest: &str) -> Result<()> {
        let src = src.to_string_lossy();
        let target = format!("{}:{}", id, dest);
        self.with_retry("copy", || {
            self.cmd()
                .args(["cp", &*src, target.as_str()])
                .run()
        })
        .await
        .map_err(|e| map_missing(e, id))?;
        Ok(())
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let output = self
            .with_retry("exec", || {
                self.cmd()
                    .arg("exec")
                    .arg(id)
                    .args(argv.iter().cloned())
                    .run_allow_failure()
            })
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() && is_daemon_unavailable(&stderr) {
            return Err(SandboxError::EngineUnavailable(stderr.trim().to_string()));
        }
        if !output.status.success() && MISSING_INSTANCE_MARKERS.iter().any(|m| stderr.contains(m))
        {
            return Err(SandboxError::NotFound(format!("sandbox {}", id)));
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code: output.status.code(),
        })
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let output = self
            .with_retry("logs", || self.cmd().args(["logs", id]).run())
            .await
            .map_err(|e| map_missing(e, id))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let source = format!("{}:{}/.", id, path.trim_end_matches('/'));
        let output = self
            .with_retry("archive", || {
                self.cmd().args(["cp", source.as_str(), "-"]).run()
            })
            .await
            .map_err(|e| map_missing(e, id))?;
        Ok(output.stdout)
    }
}
