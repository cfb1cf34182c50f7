use anyhow::Result;

use crate::config::Config;

/// Build the runtime image for a session id without launching it.
pub async fn run(config: &Config, sandbox_id: &str) -> Result<()> {
    let sandboxes = super::load_sandboxes(config)?;
    println!("Building image for '{}' with {}...", sandbox_id, sandboxes.engine_name());
    let image = sandboxes.build_image(sandbox_id).await?;
    println!("✓ Built {}", image);
    Ok(())
}
