//! Error taxonomy for sandbox lifecycle operations.

use std::path::PathBuf;

/// Failure raised by the sandbox core.
///
/// Every variant carries enough context to be shown to an API caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("No available ports found in {start}..{end}")]
    ResourceExhaustion { start: u16, end: u32 },

    #[error("Image build failed for {image}: {output}")]
    BuildFailure { image: String, output: String },

    #[error("Failed to launch sandbox {name}: {reason}")]
    LaunchFailure { name: String, reason: String },

    #[error("Failed to tear down sandbox {id}: {reason}")]
    TeardownFailure { id: String, reason: String },

    #[error("Failed to sync {path} into sandbox {id}: {reason}")]
    SyncFailure {
        id: String,
        path: String,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("'{query}' matches {count} sandboxes; use the full instance id")]
    AmbiguousId { query: String, count: usize },

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Engine command failed: {command}\n{stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Malformed engine output: {0}")]
    MalformedOutput(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Only an unreachable or hung engine is worth retrying. Build and
    /// runtime failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::EngineUnavailable(_))
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandboxError::Io {
            path: path.into(),
            source,
        }
    }

    /// Human-readable reason, used when a lower-level failure gets wrapped
    /// into an operation-specific variant.
    pub fn reason(&self) -> String {
        match self {
            SandboxError::CommandFailed { stderr, .. } if !stderr.is_empty() => stderr.clone(),
            other => other.to_string(),
        }
    }
}
