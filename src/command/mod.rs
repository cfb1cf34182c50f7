pub mod build;
pub mod exec;
pub mod list;
pub mod serve;
pub mod stop;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::engine::{DockerEngine, Engine};
use crate::sandbox::{RuntimeSettings, Sandboxes, TcpProbe};
use crate::template;

/// Wire the sandbox core from configuration.
///
/// Fails early when the engine binary is not on PATH so every subcommand
/// reports the same clear error.
pub fn load_sandboxes(config: &Config) -> Result<Arc<Sandboxes>> {
    let binary = config.runtime().binary();
    let path = which::which(binary)
        .with_context(|| format!("'{}' not found on PATH; install it or set `runtime`", binary))?;
    debug!(binary, path = %path.display(), "command:engine binary found");

    let env = template::create_template_env();
    let source = template::load_dockerfile_template(config.dockerfile.as_deref())?;
    let dockerfile =
        template::render_dockerfile(&source, &env, config.app_port(), config.source_root())?;

    let engine: Arc<dyn Engine> = Arc::new(DockerEngine::from_config(config));
    let settings = RuntimeSettings {
        project_label: config.project_label().to_string(),
        name_prefix: config.name_prefix().to_string(),
        base_port: config.base_port(),
        app_port: config.app_port(),
        source_root: config.source_root().to_string(),
        public_host: config.public_host().to_string(),
    };

    Ok(Arc::new(Sandboxes::new(
        engine,
        Arc::new(TcpProbe),
        settings,
        config.port_window(),
        dockerfile,
        template::default_app_files(),
    )))
}
