//! Image builds for sandbox runtimes.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::error::{Result, SandboxError};

/// Tag of a built sandbox image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct ImageBuilder {
    engine: Arc<dyn Engine>,
    /// Rendered Dockerfile written into every build context.
    dockerfile: String,
    name_prefix: String,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn Engine>, dockerfile: String, name_prefix: &str) -> Self {
        Self {
            engine,
            dockerfile,
            name_prefix: name_prefix.to_string(),
        }
    }

    /// Build the runtime image for a sandbox.
    ///
    /// The build context lives in a fresh temporary directory that is removed
    /// when this function returns, whether the build succeeded or not.
    pub async fn build_image(&self, sandbox_id: &str) -> Result<ImageRef> {
        let image_name = super::instance_name(&self.name_prefix, sandbox_id);

        let temp_dir = tempfile::Builder::new()
            .prefix("sandboxd-build-")
            .tempdir()
            .map_err(|e| SandboxError::io(std::env::temp_dir(), e))?;
        let context_path = temp_dir.path();

        let dockerfile_path = context_path.join("Dockerfile");
        tokio::fs::write(&dockerfile_path, &self.dockerfile)
            .await
            .map_err(|e| SandboxError::io(&dockerfile_path, e))?;

        info!(image = %image_name, "image:build start");
        match self.engine.build(context_path, &image_name).await {
            Ok(output) => {
                debug!(image = %image_name, output = %output.trim(), "image:build output");
                info!(image = %image_name, "image:build done");
                Ok(ImageRef::new(image_name))
            }
            Err(SandboxError::CommandFailed { stderr, .. }) => {
                error!(image = %image_name, stderr = %stderr, "image:build failed");
                Err(SandboxError::BuildFailure {
                    image: image_name,
                    output: stderr,
                })
            }
            Err(e) => {
                error!(image = %image_name, error = %e, "image:build failed");
                Err(e)
            }
        }
    }
}
