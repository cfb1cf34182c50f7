//! Sandbox instance lifecycle: run, start, stop, list.
//!
//! Nothing here is persisted locally. Port, session id and staging directory
//! are stamped on the instance as labels so every listing can rebuild the
//! full picture from the engine alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::files::{FileMap, stage_files, validate_file_map};
use super::image::ImageRef;
use super::ports::PortAllocator;
use super::{
    ASSIGNED_PORT_LABEL, LaunchedSandbox, PROJECT_LABEL, SESSION_LABEL, STAGING_LABEL,
    SandboxStatus, SandboxSummary, assigned_port, instance_name,
};
use crate::engine::{Engine, RunSpec};
use crate::error::{Result, SandboxError};

/// Prefix of bind-mounted staging directories. Teardown only deletes
/// directories carrying it.
const STAGING_PREFIX: &str = "sandboxd-files-";

/// Pick the single sandbox satisfying `pred`. More than one is an error,
/// never a guess.
fn resolve(
    listed: Vec<SandboxSummary>,
    query: &str,
    pred: impl Fn(&SandboxSummary) -> bool,
) -> Result<SandboxSummary> {
    let mut hits: Vec<SandboxSummary> = listed.into_iter().filter(|s| pred(s)).collect();
    match hits.len() {
        0 => Err(SandboxError::NotFound(format!("sandbox {}", query))),
        1 => Ok(hits.remove(0)),
        count => Err(SandboxError::AmbiguousId {
            query: query.to_string(),
            count,
        }),
    }
}

/// Static layout shared by every sandbox this process launches.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub project_label: String,
    pub name_prefix: String,
    pub base_port: u16,
    pub app_port: u16,
    pub source_root: String,
    pub public_host: String,
}

pub struct RuntimeManager {
    engine: Arc<dyn Engine>,
    ports: Arc<PortAllocator>,
    settings: RuntimeSettings,
}

impl RuntimeManager {
    pub fn new(engine: Arc<dyn Engine>, ports: Arc<PortAllocator>, settings: RuntimeSettings) -> Self {
        Self {
            engine,
            ports,
            settings,
        }
    }

    fn label_filter(&self) -> String {
        format!("{}={}", PROJECT_LABEL, self.settings.project_label)
    }

    /// Launch a sandbox from `image` with `files` as its initial source tree.
    ///
    /// On any failure after the port was reserved, the port is released and
    /// the staging directory removed before the error is returned.
    pub async fn run(
        &self,
        image: &ImageRef,
        sandbox_id: &str,
        files: &FileMap,
    ) -> Result<LaunchedSandbox> {
        let validated = validate_file_map(files)?;
        let name = instance_name(&self.settings.name_prefix, sandbox_id);
        let port = self.ports.reserve(self.settings.base_port).await?;

        match self.launch(image, sandbox_id, &name, port, &validated).await {
            Ok(instance_id) => {
                let url = sandbox_url(&self.settings.public_host, port);
                info!(name = %name, instance = %instance_id, port, url = %url, "sandbox:started");
                Ok(LaunchedSandbox {
                    instance_id,
                    name,
                    port,
                    url,
                })
            }
            Err(e) => {
                self.ports.release(port).await;
                warn!(name = %name, port, error = %e, "sandbox:launch failed, port released");
                Err(match e {
                    SandboxError::EngineUnavailable(_) => e,
                    other => SandboxError::LaunchFailure {
                        name,
                        reason: other.reason(),
                    },
                })
            }
        }
    }

    async fn launch(
        &self,
        image: &ImageRef,
        sandbox_id: &str,
        name: &str,
        port: u16,
        files: &[(PathBuf, &str)],
    ) -> Result<String> {
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}{}-", STAGING_PREFIX, super::slugify_id(sandbox_id)))
            .tempdir()
            .map_err(|e| SandboxError::io(std::env::temp_dir(), e))?;
        stage_files(staging.path(), files).await?;
        debug!(name, staging = %staging.path().display(), files = files.len(), "sandbox:staged");

        let mut labels = BTreeMap::new();
        labels.insert(PROJECT_LABEL.to_string(), self.settings.project_label.clone());
        labels.insert(ASSIGNED_PORT_LABEL.to_string(), port.to_string());
        labels.insert(SESSION_LABEL.to_string(), sandbox_id.to_string());
        labels.insert(
            STAGING_LABEL.to_string(),
            staging.path().to_string_lossy().to_string(),
        );

        let spec = RunSpec {
            image: image.as_str().to_string(),
            name: name.to_string(),
            host_port: port,
            app_port: self.settings.app_port,
            mount_source: staging.path().to_path_buf(),
            mount_target: self.settings.source_root.clone(),
            labels,
        };
        let instance_id = self.engine.run(&spec).await?;

        // The instance now owns the directory through its bind mount.
        let _ = staging.keep();
        Ok(instance_id)
    }

    /// Stop and remove an instance, releasing its port.
    ///
    /// Both engine steps are attempted even if the first fails. A second call
    /// for the same id reports `NotFound`.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let labels = self.engine.inspect_labels(id).await?;

        match assigned_port(&labels) {
            Some(port) => {
                self.ports.release(port).await;
            }
            None => warn!(id, "sandbox:stop no assigned port label"),
        }

        let stop_result = self.engine.stop(id).await;
        if let Err(e) = &stop_result {
            warn!(id, error = %e, "sandbox:stop failed");
        }
        let remove_result = self.engine.remove(id).await;
        if let Err(e) = &remove_result {
            warn!(id, error = %e, "sandbox:remove failed");
        }

        match (stop_result, remove_result) {
            (_, Ok(())) => {
                if let Some(dir) = labels.get(STAGING_LABEL) {
                    remove_staging_dir(Path::new(dir)).await;
                }
                info!(id, "sandbox:stopped and removed");
                Ok(())
            }
            (Ok(()), Err(remove_err)) => Err(SandboxError::TeardownFailure {
                id: id.to_string(),
                reason: format!("stopped but not removed: {}", remove_err.reason()),
            }),
            (Err(stop_err), Err(remove_err)) => Err(SandboxError::TeardownFailure {
                id: id.to_string(),
                reason: format!(
                    "stop: {}; remove: {}",
                    stop_err.reason(),
                    remove_err.reason()
                ),
            }),
        }
    }

    /// Every sandbox of this project the engine knows about.
    pub async fn list(&self) -> Result<Vec<SandboxSummary>> {
        let rows = self.engine.list(&self.label_filter()).await?;
        let summaries: Vec<SandboxSummary> = rows
            .iter()
            .map(|row| SandboxSummary::from_row(row, &self.settings.public_host))
            .filter(|summary| summary.status != SandboxStatus::Removed)
            .collect();
        debug!(count = summaries.len(), "sandbox:listed");
        Ok(summaries)
    }

    /// Find a sandbox by instance id, short id prefix, or name fragment.
    /// Resolve `id` to exactly one sandbox of this project.
    pub async fn find(&self, id: &str) -> Result<SandboxSummary> {
        let listed = self.list().await?;
        resolve(listed, id, |s| s.matches(id))
    }

    /// Make sure a sandbox is running and return its summary.
    ///
    /// Besides the exact forms `find` accepts, a name fragment picks the
    /// sandbox when exactly one name contains it.
    pub async fn start(&self, id: &str) -> Result<SandboxSummary> {
        let listed = self.list().await?;
        let summary = if listed.iter().any(|s| s.matches(id)) {
            resolve(listed, id, |s| s.matches(id))?
        } else {
            resolve(listed, id, |s| s.name_contains(id))?
        };
        if summary.status == SandboxStatus::Running {
            return Ok(summary);
        }
        info!(id = %summary.id, "sandbox:starting stopped instance");
        self.engine.start(&summary.id).await.map_err(|e| match e {
            SandboxError::EngineUnavailable(_) | SandboxError::NotFound(_) => e,
            other => SandboxError::LaunchFailure {
                name: summary.name.clone(),
                reason: other.reason(),
            },
        })?;
        self.find(&summary.id).await
    }

    /// Instance logs with terminal escapes stripped.
    pub async fn logs(&self, id: &str) -> Result<String> {
        let raw = self.engine.logs(id).await?;
        Ok(String::from_utf8_lossy(&strip_ansi_escapes::strip(raw.as_bytes())).into_owned())
    }
}

pub fn sandbox_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

async fn remove_staging_dir(dir: &Path) {
    let owned = dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(STAGING_PREFIX));
    if !owned {
        warn!(dir = %dir.display(), "sandbox:refusing to remove foreign staging dir");
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dir = %dir.display(), error = %e, "sandbox:failed to remove staging dir");
    }
}
