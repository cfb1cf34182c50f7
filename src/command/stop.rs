use anyhow::{Context, Result};

use crate::config::Config;

pub async fn run(config: &Config, id: &str) -> Result<()> {
    let sandboxes = super::load_sandboxes(config)?;
    sandboxes
        .stop(id)
        .await
        .with_context(|| format!("Failed to stop sandbox '{}'", id))?;
    println!("✓ Stopped and removed sandbox '{}'", id);
    Ok(())
}
