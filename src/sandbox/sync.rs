//! Moving files in and out of running sandboxes.

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::files::{
    FileMap, normalize_relative_path, sandbox_path, stage_files, strip_source_root,
    validate_file_map,
};
use crate::engine::Engine;
use crate::error::{Result, SandboxError};

/// Extensions shown by the source file listing.
const SOURCE_EXTENSIONS: &[&str] = &["tsx", "ts", "js", "jsx", "json"];
/// Extensions read into the content tree.
const CONTENT_EXTENSIONS: &[&str] = &["tsx", "ts", "js", "jsx"];
const LISTING_LIMIT: usize = 20;
const CONTENT_TREE_LIMIT: usize = 10;
/// Directories never walked into. Dependency installs land in the source root.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".next", ".git"];

/// Outcome of one path in a write batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathResult {
    pub path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-path results of a write batch. Paths copied before a failure stay
/// applied; nothing is rolled back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    #[serde(skip)]
    pub id: String,
    pub results: Vec<PathResult>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PathResult> {
        self.results.iter().filter(|r| !r.ok)
    }

    /// Treat any failed path as an error, naming the first one.
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failures().next().cloned();
        match failed {
            Some(failed) => Err(SandboxError::SyncFailure {
                id: self.id,
                path: failed.path,
                reason: failed.error.unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

/// One file inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Absolute path inside the sandbox
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileEntry {
    fn file(path: String, size: u64) -> Self {
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            name,
            path,
            kind: "file",
            size,
            content: None,
        }
    }

    fn has_extension(&self, extensions: &[&str]) -> bool {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.contains(&ext))
    }
}

pub struct FileSync {
    engine: Arc<dyn Engine>,
    source_root: String,
}

impl FileSync {
    pub fn new(engine: Arc<dyn Engine>, source_root: &str) -> Self {
        Self {
            engine,
            source_root: source_root.to_string(),
        }
    }

    pub fn source_root(&self) -> &str {
        &self.source_root
    }

    /// Copy every file of `files` into the sandbox source root.
    ///
    /// Invalid paths reject the whole batch before anything is copied. A
    /// missing sandbox or unreachable engine aborts the batch; any other
    /// per-file failure is recorded and the remaining files are still copied.
    pub async fn write(&self, id: &str, files: &FileMap) -> Result<SyncReport> {
        let validated = validate_file_map(files)?;
        let staging = tempfile::Builder::new()
            .prefix("sandboxd-sync-")
            .tempdir()
            .map_err(|e| SandboxError::io(std::env::temp_dir(), e))?;
        stage_files(staging.path(), &validated).await?;

        let parents: BTreeSet<String> = validated
            .iter()
            .filter_map(|(relative, _)| relative.parent())
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| sandbox_path(&self.source_root, parent))
            .collect();
        if !parents.is_empty() {
            let mut argv = vec!["mkdir".to_string(), "-p".to_string(), "--".to_string()];
            argv.extend(parents);
            let out = self.engine.exec(id, &argv).await?;
            if !out.success() {
                warn!(id, stderr = %out.stderr.trim(), "sync:mkdir failed");
            }
        }

        let mut results = Vec::with_capacity(validated.len());
        for (relative, _) in &validated {
            let dest = sandbox_path(&self.source_root, relative);
            let shown = relative.to_string_lossy().to_string();
            match self.engine.copy_in(&staging.path().join(relative), id, &dest).await {
                Ok(()) => results.push(PathResult {
                    path: shown,
                    ok: true,
                    error: None,
                }),
                Err(e @ (SandboxError::NotFound(_) | SandboxError::EngineUnavailable(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(id, path = %shown, error = %e, "sync:copy failed");
                    results.push(PathResult {
                        path: shown,
                        ok: false,
                        error: Some(e.reason()),
                    });
                }
            }
        }

        let report = SyncReport {
            id: id.to_string(),
            results,
        };
        info!(
            id,
            files = report.results.len(),
            failed = report.failures().count(),
            "sync:write done"
        );
        Ok(report)
    }

    /// Read one file relative to the source root.
    pub async fn read(&self, id: &str, path: &str) -> Result<String> {
        let relative = normalize_relative_path(path)?;
        let dest = sandbox_path(&self.source_root, &relative);
        let argv = ["cat".to_string(), "--".to_string(), dest];
        let out = self.engine.exec(id, &argv).await?;
        if out.success() {
            return Ok(out.stdout);
        }
        if out.stderr.contains("No such file") || out.stderr.contains("Is a directory") {
            return Err(SandboxError::NotFound(format!("file {}", path)));
        }
        Err(SandboxError::CommandFailed {
            command: format!("cat {}", path),
            status: out.exit_code,
            stderr: out.stderr,
        })
    }

    /// Run a read-only shell command inside the sandbox and return raw stdout.
    ///
    /// Output is whatever the tools inside the image print; callers parse it
    /// at their own risk.
    pub async fn exec_read(&self, id: &str, command: &str) -> Result<String> {
        let argv = ["sh".to_string(), "-c".to_string(), command.to_string()];
        let out = self.engine.exec(id, &argv).await?;
        if !out.success() {
            return Err(SandboxError::CommandFailed {
                command: command.to_string(),
                status: out.exit_code,
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }

    /// Every file under the source root as `(relative path, size)`, sorted.
    ///
    /// Uses the engine's archive stream. When that is unavailable it falls
    /// back to parsing `find -print0`, which depends on the tools installed
    /// in the image and reports no sizes.
    pub async fn walk(&self, id: &str) -> Result<Vec<(String, u64)>> {
        let mut entries = match self.walk_archive(id).await {
            Ok(entries) => entries,
            Err(e @ (SandboxError::NotFound(_) | SandboxError::EngineUnavailable(_))) => {
                return Err(e);
            }
            Err(e) => {
                warn!(id, error = %e, "sync:archive walk unavailable, falling back to find");
                self.walk_find(id).await?
            }
        };
        entries.retain(|(path, _)| !is_skipped(path));
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);
        debug!(id, files = entries.len(), "sync:walked");
        Ok(entries)
    }

    async fn walk_archive(&self, id: &str) -> Result<Vec<(String, u64)>> {
        let bytes = self.engine.archive(id, &self.source_root).await?;
        let mut archive = tar::Archive::new(bytes.as_slice());
        let malformed = |e: std::io::Error| SandboxError::MalformedOutput(format!("archive: {}", e));

        let mut entries = Vec::new();
        for entry in archive.entries().map_err(malformed)? {
            let entry = entry.map_err(malformed)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(malformed)?;
            let relative: Vec<String> = path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                    _ => None,
                })
                .collect();
            if relative.is_empty() {
                continue;
            }
            entries.push((relative.join("/"), entry.size()));
        }
        Ok(entries)
    }

    async fn walk_find(&self, id: &str) -> Result<Vec<(String, u64)>> {
        let argv = [
            "find".to_string(),
            self.source_root.clone(),
            "-type".to_string(),
            "f".to_string(),
            "-print0".to_string(),
        ];
        let out = self.engine.exec(id, &argv).await?;
        if !out.success() {
            return Err(SandboxError::CommandFailed {
                command: format!("find {}", self.source_root),
                status: out.exit_code,
                stderr: out.stderr,
            });
        }
        Ok(out
            .stdout
            .split('\0')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| (strip_source_root(&self.source_root, p).to_string(), 0))
            .filter(|(p, _)| !p.is_empty())
            .collect())
    }

    /// Source files under `dir` (relative to the source root), capped.
    pub async fn list_source_files(&self, id: &str, dir: Option<&str>) -> Result<Vec<FileEntry>> {
        let prefix = match dir.map(str::trim) {
            None | Some("") | Some(".") | Some("/") => None,
            Some(dir) => {
                let dir = strip_source_root(&self.source_root, dir);
                match dir {
                    "" => None,
                    dir => Some(format!(
                        "{}/",
                        normalize_relative_path(dir)?.to_string_lossy()
                    )),
                }
            }
        };
        Ok(self
            .walk(id)
            .await?
            .into_iter()
            .filter(|(path, _)| prefix.as_deref().is_none_or(|p| path.starts_with(p)))
            .map(|(path, size)| FileEntry::file(self.absolute(&path), size))
            .filter(|entry| entry.has_extension(SOURCE_EXTENSIONS))
            .take(LISTING_LIMIT)
            .collect())
    }

    /// A handful of source files with their content. Unreadable files are skipped.
    pub async fn content_tree(&self, id: &str) -> Result<Vec<FileEntry>> {
        let candidates: Vec<(String, FileEntry)> = self
            .walk(id)
            .await?
            .into_iter()
            .map(|(path, size)| {
                let entry = FileEntry::file(self.absolute(&path), size);
                (path, entry)
            })
            .filter(|(_, entry)| entry.has_extension(CONTENT_EXTENSIONS))
            .take(CONTENT_TREE_LIMIT)
            .collect();

        let mut tree = Vec::with_capacity(candidates.len());
        for (relative, mut entry) in candidates {
            match self.read(id, &relative).await {
                Ok(content) => {
                    entry.content = Some(content);
                    tree.push(entry);
                }
                Err(e @ SandboxError::EngineUnavailable(_)) => return Err(e),
                Err(e) => warn!(id, path = %relative, error = %e, "sync:could not read file"),
            }
        }
        Ok(tree)
    }

    /// Gzip-compressed tar of the source root.
    pub async fn export(&self, id: &str) -> Result<Vec<u8>> {
        let tar = self.engine.archive(id, &self.source_root).await?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(&tar)
            .and_then(|_| encoder.finish())
            .map_err(|e| SandboxError::io("<export>", e))?;
        info!(id, raw = tar.len(), compressed = compressed.len(), "sync:exported");
        Ok(compressed)
    }

    fn absolute(&self, relative: &str) -> String {
        sandbox_path(&self.source_root, Path::new(relative))
    }
}

fn is_skipped(relative: &str) -> bool {
    relative.split('/').any(|part| SKIPPED_DIRS.contains(&part))
}

/// Unpack a gzip-compressed tar into `(path, content)` pairs.
#[cfg(test)]
pub(crate) fn unpack_export(bytes: &[u8]) -> Vec<(String, String)> {
    use std::io::Read;

    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let path = path.trim_start_matches("./").to_string();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        files.push((path, content));
    }
    files
}
