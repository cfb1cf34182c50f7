//! Sandbox lifecycle core.
//!
//! The container engine is the registry: every sandbox is tagged with the
//! project label and its assigned port, and all state shown to callers is
//! rebuilt from the engine's listing on demand.

mod files;
mod image;
mod ports;
mod runtime;
mod sync;
mod tree;

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::{Engine, EngineRow};
use crate::error::{Result, SandboxError};

pub use files::FileMap;
pub use image::{ImageBuilder, ImageRef};
pub use ports::{PortAllocator, PortProbe, TcpProbe};
pub use runtime::{RuntimeManager, RuntimeSettings, sandbox_url};
pub use sync::{FileEntry, FileSync, SyncReport};
pub use tree::FileNode;
#[cfg(test)]
pub(crate) use sync::unpack_export;

/// Label identifying instances owned by this project.
pub const PROJECT_LABEL: &str = "project";
/// Label carrying the host port assigned at launch.
pub const ASSIGNED_PORT_LABEL: &str = "assignedPort";
/// Label carrying the session id the sandbox was created for.
pub const SESSION_LABEL: &str = "sandboxId";
/// Label carrying the host staging directory bind-mounted into the instance.
pub const STAGING_LABEL: &str = "stagingDir";

pub const MANIFEST_PATH: &str = "package.json";

/// Shown as `type` in create and list responses.
pub const APP_KIND: &str = "Next.js App";

/// Port recorded on the instance at launch, if any.
pub fn assigned_port(labels: &BTreeMap<String, String>) -> Option<u16> {
    labels
        .get(ASSIGNED_PORT_LABEL)
        .and_then(|value| value.trim().parse().ok())
}

/// Slug of a session id usable in engine names.
pub fn slugify_id(id: &str) -> String {
    match slug::slugify(id) {
        s if s.is_empty() => "sandbox".to_string(),
        s => s,
    }
}

/// Deterministic image and instance name for a session.
pub fn instance_name(prefix: &str, sandbox_id: &str) -> String {
    format!("{}-{}", prefix, slugify_id(sandbox_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Removed,
}

impl SandboxStatus {
    /// Normalize the engine's state, falling back to the status text when
    /// the engine does not report a machine state.
    pub fn from_row(row: &EngineRow) -> Self {
        let state = row
            .state
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match state.as_str() {
            "running" | "restarting" => return Self::Running,
            "removing" | "dead" => return Self::Removed,
            "exited" | "created" | "paused" | "stopped" | "configured" => return Self::Stopped,
            _ => {}
        }

        let text = row.status_text.trim();
        if text.starts_with("Up") {
            Self::Running
        } else if text.starts_with("Removal") || text.starts_with("Dead") {
            Self::Removed
        } else {
            Self::Stopped
        }
    }
}

/// A sandbox as reconstructed from one engine listing row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSummary {
    pub id: String,
    pub name: String,
    pub status: SandboxStatus,
    pub status_text: String,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub sandbox_id: Option<String>,
    pub created_at: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl SandboxSummary {
    pub fn from_row(row: &EngineRow, public_host: &str) -> Self {
        let status = SandboxStatus::from_row(row);
        let port = assigned_port(&row.labels).or_else(|| row.host_ports.first().copied());
        Self {
            id: row.id.clone(),
            name: row.name.trim_start_matches('/').to_string(),
            status,
            status_text: row.status_text.clone(),
            port,
            url: port.map(|p| sandbox_url(public_host, p)),
            sandbox_id: row.labels.get(SESSION_LABEL).cloned(),
            created_at: row.created_at.clone(),
            kind: APP_KIND,
        }
    }

    /// Matches a full instance id, an id prefix of at least 12 characters,
    /// the session id, or the exact instance name.
    pub fn matches(&self, query: &str) -> bool {
        if query.is_empty() {
            return false;
        }
        self.id == query
            || (query.len() >= 12 && self.id.starts_with(query))
            || self.sandbox_id.as_deref() == Some(query)
            || self.name == query
    }

    pub fn name_contains(&self, fragment: &str) -> bool {
        !fragment.is_empty() && self.name.contains(fragment)
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedSandbox {
    pub instance_id: String,
    pub name: String,
    pub port: u16,
    pub url: String,
}

/// Response body for a newly created sandbox.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSandbox {
    pub id: String,
    pub container_id: String,
    pub status: SandboxStatus,
    pub port: u16,
    pub url: String,
    pub created_at: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Everything the HTTP layer and CLI need, wired once at startup.
pub struct Sandboxes {
    engine: Arc<dyn Engine>,
    images: ImageBuilder,
    runtime: RuntimeManager,
    sync: FileSync,
    initial_files: FileMap,
}

impl Sandboxes {
    pub fn new(
        engine: Arc<dyn Engine>,
        probe: Arc<dyn PortProbe>,
        settings: RuntimeSettings,
        port_window: u16,
        dockerfile: String,
        initial_files: FileMap,
    ) -> Self {
        let ports = Arc::new(PortAllocator::new(
            engine.clone(),
            probe,
            &settings.project_label,
            port_window,
        ));
        let images = ImageBuilder::new(engine.clone(), dockerfile, &settings.name_prefix);
        let sync = FileSync::new(engine.clone(), &settings.source_root);
        let runtime = RuntimeManager::new(engine.clone(), ports, settings);
        Self {
            engine,
            images,
            runtime,
            sync,
            initial_files,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Whether the engine daemon answers.
    pub async fn engine_ready(&self) -> Result<bool> {
        self.engine.ping().await
    }

    /// Create a sandbox for a fresh session: build its image and launch it
    /// with the initial app files.
    pub async fn create(&self) -> Result<CreatedSandbox> {
        let sandbox_id = uuid::Uuid::new_v4().to_string();
        self.create_for(&sandbox_id, &self.initial_files).await
    }

    pub async fn create_for(&self, sandbox_id: &str, files: &FileMap) -> Result<CreatedSandbox> {
        info!(sandbox_id, "sandbox:create");
        let image = self.images.build_image(sandbox_id).await?;
        let launched = self.runtime.run(&image, sandbox_id, files).await?;
        Ok(CreatedSandbox {
            id: sandbox_id.to_string(),
            container_id: launched.instance_id,
            status: SandboxStatus::Running,
            port: launched.port,
            url: launched.url,
            created_at: Utc::now().to_rfc3339(),
            kind: APP_KIND,
        })
    }

    pub async fn build_image(&self, sandbox_id: &str) -> Result<ImageRef> {
        self.images.build_image(sandbox_id).await
    }

    pub async fn list(&self) -> Result<Vec<SandboxSummary>> {
        self.runtime.list().await
    }

    pub async fn find(&self, id: &str) -> Result<SandboxSummary> {
        self.runtime.find(id).await
    }

    pub async fn start(&self, id: &str) -> Result<SandboxSummary> {
        self.runtime.start(id).await
    }

    /// Stop and remove a sandbox of this project. Unknown ids are `NotFound`.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let summary = self.find(id).await?;
        self.runtime.stop(&summary.id).await
    }

    pub async fn logs(&self, id: &str) -> Result<String> {
        let summary = self.find(id).await?;
        self.runtime.logs(&summary.id).await
    }

    pub async fn read_file(&self, id: &str, path: &str) -> Result<String> {
        let summary = self.find(id).await?;
        self.sync.read(&summary.id, path).await
    }

    /// Apply a batch of file writes and report the outcome of every path.
    pub async fn write_files(&self, id: &str, files: &FileMap) -> Result<SyncReport> {
        let summary = self.find(id).await?;
        self.sync.write(&summary.id, files).await
    }

    pub async fn list_files(&self, id: &str, dir: Option<&str>) -> Result<Vec<FileEntry>> {
        let summary = self.find(id).await?;
        self.sync.list_source_files(&summary.id, dir).await
    }

    pub async fn file_tree(&self, id: &str) -> Result<FileNode> {
        let summary = self.find(id).await?;
        let entries = self.sync.walk(&summary.id).await?;
        let tree = FileNode::from_entries(self.sync.source_root(), &entries);
        debug!(id = %summary.id, files = tree.file_count(), "sandbox:file tree");
        Ok(tree)
    }

    pub async fn file_content_tree(&self, id: &str) -> Result<Vec<FileEntry>> {
        let summary = self.find(id).await?;
        self.sync.content_tree(&summary.id).await
    }

    pub async fn read_manifest(&self, id: &str) -> Result<serde_json::Value> {
        let raw = self.read_file(id, MANIFEST_PATH).await?;
        serde_json::from_str(&raw).map_err(|e| {
            SandboxError::MalformedOutput(format!("{} is not valid JSON: {}", MANIFEST_PATH, e))
        })
    }

    pub async fn write_manifest(&self, id: &str, manifest: &serde_json::Value) -> Result<()> {
        let content = serde_json::to_string_pretty(manifest).map_err(|e| {
            SandboxError::MalformedOutput(format!("cannot serialize {}: {}", MANIFEST_PATH, e))
        })?;
        let mut files = FileMap::new();
        files.insert(MANIFEST_PATH.to_string(), format!("{}\n", content));
        self.write_files(id, &files).await?.into_result().map(|_| ())
    }

    /// Raw stdout of a read-only shell command run inside the sandbox.
    pub async fn exec_read(&self, id: &str, command: &str) -> Result<String> {
        let summary = self.find(id).await?;
        self.sync.exec_read(&summary.id, command).await
    }

    /// Gzip-compressed tar of the sandbox source root.
    pub async fn export(&self, id: &str) -> Result<Vec<u8>> {
        let summary = self.find(id).await?;
        self.sync.export(&summary.id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::sandbox::ports::tests::StaticProbe;
    use crate::sandbox::runtime::tests::settings;

    pub(crate) fn sandboxes(engine: &Arc<FakeEngine>) -> Sandboxes {
        Sandboxes::new(
            engine.clone(),
            Arc::new(StaticProbe::default()),
            settings(),
            1000,
            "FROM scratch\n".to_string(),
            crate::template::default_app_files(),
        )
    }

    fn row(state: Option<&str>, status_text: &str) -> EngineRow {
        EngineRow {
            id: "abc".to_string(),
            name: "/dec-nextjs-a".to_string(),
            state: state.map(str::to_string),
            status_text: status_text.to_string(),
            host_ports: vec![8005],
            labels: BTreeMap::new(),
            created_at: None,
        }
    }

    #[test]
    fn test_instance_name_is_slugged() {
        assert_eq!(instance_name("dec-nextjs", "Hello World_1"), "dec-nextjs-hello-world-1");
        assert_eq!(instance_name("dec-nextjs", "!!!"), "dec-nextjs-sandbox");
    }

    #[test]
    fn test_assigned_port() {
        let mut labels = BTreeMap::new();
        assert_eq!(assigned_port(&labels), None);
        labels.insert(ASSIGNED_PORT_LABEL.to_string(), "8012".to_string());
        assert_eq!(assigned_port(&labels), Some(8012));
        labels.insert(ASSIGNED_PORT_LABEL.to_string(), "garbage".to_string());
        assert_eq!(assigned_port(&labels), None);
    }

    #[test]
    fn test_status_from_state() {
        assert_eq!(SandboxStatus::from_row(&row(Some("running"), "")), SandboxStatus::Running);
        assert_eq!(SandboxStatus::from_row(&row(Some("exited"), "")), SandboxStatus::Stopped);
        assert_eq!(SandboxStatus::from_row(&row(Some("created"), "")), SandboxStatus::Stopped);
        assert_eq!(SandboxStatus::from_row(&row(Some("dead"), "")), SandboxStatus::Removed);
    }

    #[test]
    fn test_status_from_text_when_state_missing() {
        assert_eq!(
            SandboxStatus::from_row(&row(None, "Up 5 minutes")),
            SandboxStatus::Running
        );
        assert_eq!(
            SandboxStatus::from_row(&row(None, "Exited (137) 2 hours ago")),
            SandboxStatus::Stopped
        );
        assert_eq!(
            SandboxStatus::from_row(&row(None, "Removal In Progress")),
            SandboxStatus::Removed
        );
        assert_eq!(SandboxStatus::from_row(&row(None, "???")), SandboxStatus::Stopped);
    }

    #[test]
    fn test_summary_prefers_port_label() {
        let mut r = row(Some("running"), "Up 1 second");
        let summary = SandboxSummary::from_row(&r, "example.test");
        assert_eq!(summary.port, Some(8005));
        assert_eq!(summary.name, "dec-nextjs-a");
        assert_eq!(summary.url.as_deref(), Some("http://example.test:8005"));

        r.labels.insert(ASSIGNED_PORT_LABEL.to_string(), "8009".to_string());
        assert_eq!(SandboxSummary::from_row(&r, "localhost").port, Some(8009));
    }

    #[test]
    fn test_summary_matches() {
        let mut r = row(Some("running"), "Up");
        r.id = "0123456789abcdef0123".to_string();
        r.labels.insert(SESSION_LABEL.to_string(), "session-1".to_string());
        let summary = SandboxSummary::from_row(&r, "localhost");
        assert!(summary.matches("0123456789abcdef0123"));
        assert!(summary.matches("0123456789ab"));
        assert!(summary.matches("session-1"));
        assert!(summary.matches("dec-nextjs-a"));
        assert!(!summary.matches("nextjs-a"));
        assert!(!summary.matches("0123"));
        assert!(!summary.matches(""));
        assert!(summary.name_contains("nextjs-a"));
        assert!(!summary.name_contains(""));
    }

    #[tokio::test]
    async fn test_stop_by_name_fragment_is_not_found() {
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = sandboxes(&engine);
        let files = FileMap::new();
        sandboxes.create_for("a", &files).await.unwrap();
        sandboxes.create_for("b", &files).await.unwrap();

        for fragment in ["nextjs", "-", "dec-nextjs"] {
            assert!(
                matches!(sandboxes.stop(fragment).await, Err(SandboxError::NotFound(_))),
                "{fragment}"
            );
        }
        assert_eq!(sandboxes.list().await.unwrap().len(), 2);

        sandboxes.stop("dec-nextjs-b").await.unwrap();
        let left = sandboxes.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sandbox_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_create_then_list_and_stop() {
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = sandboxes(&engine);

        let created = sandboxes.create().await.unwrap();
        assert_eq!(created.port, 8000);
        assert_eq!(created.status, SandboxStatus::Running);
        assert!(uuid::Uuid::parse_str(&created.id).is_ok());

        let listed = sandboxes.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sandbox_id.as_deref(), Some(created.id.as_str()));

        let manifest = sandboxes.read_manifest(&created.id).await.unwrap();
        assert_eq!(manifest["dependencies"]["next"], "13.4.19");

        sandboxes.stop(&created.id).await.unwrap();
        assert!(sandboxes.list().await.unwrap().is_empty());
        assert!(matches!(
            sandboxes.stop(&created.id).await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_ports() {
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = Arc::new(sandboxes(&engine));
        let a = {
            let s = Arc::clone(&sandboxes);
            tokio::spawn(async move { s.create().await.unwrap() })
        };
        let b = {
            let s = Arc::clone(&sandboxes);
            tokio::spawn(async move { s.create().await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_ne!(a.port, b.port);
    }

    #[tokio::test]
    async fn test_build_failure_launches_nothing() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_build("boom");
        let sandboxes = sandboxes(&engine);
        assert!(matches!(
            sandboxes.create().await,
            Err(SandboxError::BuildFailure { .. })
        ));
        assert_eq!(engine.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = sandboxes(&engine);
        let created = sandboxes.create().await.unwrap();

        let manifest = serde_json::json!({ "name": "renamed", "dependencies": { "zod": "^3" } });
        sandboxes.write_manifest(&created.id, &manifest).await.unwrap();
        assert_eq!(sandboxes.read_manifest(&created.id).await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_malformed() {
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = sandboxes(&engine);
        let created = sandboxes.create().await.unwrap();
        let mut files = FileMap::new();
        files.insert(MANIFEST_PATH.to_string(), "{ not json".to_string());
        sandboxes.write_files(&created.id, &files).await.unwrap();

        assert!(matches!(
            sandboxes.read_manifest(&created.id).await,
            Err(SandboxError::MalformedOutput(_))
        ));
    }

    #[tokio::test]
    async fn test_file_ops_on_unknown_sandbox() {
        let engine = Arc::new(FakeEngine::new());
        let sandboxes = sandboxes(&engine);
        assert!(matches!(
            sandboxes.read_file("missing", "x.ts").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            sandboxes.file_tree("missing").await,
            Err(SandboxError::NotFound(_))
        ));
    }
}
