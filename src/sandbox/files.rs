//! File maps and host-side staging.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use crate::error::{Result, SandboxError};

/// Relative path -> text content. Paths are relative to the sandbox source root.
pub type FileMap = BTreeMap<String, String>;

/// Normalize a caller-supplied relative path.
///
/// Leading `./` segments are dropped. Absolute paths, `..` segments and empty
/// paths are rejected so nothing can escape the staging directory or the
/// sandbox source root.
pub fn normalize_relative_path(raw: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidPath(raw.to_string()));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(SandboxError::InvalidPath(raw.to_string()));
    }
    Ok(normalized)
}

/// Join a relative path onto the in-sandbox source root.
pub fn sandbox_path(source_root: &str, relative: &Path) -> String {
    let relative = relative.to_string_lossy();
    if source_root == "/" {
        format!("/{}", relative)
    } else {
        format!("{}/{}", source_root, relative)
    }
}

/// Strip the source root prefix from an in-sandbox absolute path.
pub fn strip_source_root<'a>(source_root: &str, path: &'a str) -> &'a str {
    path.strip_prefix(source_root)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

/// Validate every key of a file map up front, so a bad path fails the whole
/// request before anything touches disk.
pub fn validate_file_map(files: &FileMap) -> Result<Vec<(PathBuf, &str)>> {
    files
        .iter()
        .map(|(path, content)| Ok((normalize_relative_path(path)?, content.as_str())))
        .collect()
}

/// Write a validated file map under `dir`, creating intermediate directories.
pub async fn stage_files(dir: &Path, files: &[(PathBuf, &str)]) -> Result<()> {
    for (relative, content) in files {
        let full_path = dir.join(relative);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(parent, e))?;
        }
        tokio::fs::write(&full_path, content)
            .await
            .map_err(|e| SandboxError::io(&full_path, e))?;
        trace!(path = %relative.display(), bytes = content.len(), "files:staged");
    }
    Ok(())
}
