use anyhow::{Result, bail};

use crate::config::Config;

/// Run a read-only shell command in a sandbox and print its raw output.
pub async fn run(config: &Config, id: &str, command: &[String]) -> Result<()> {
    if command.is_empty() {
        bail!("No command given");
    }
    let sandboxes = super::load_sandboxes(config)?;
    let output = sandboxes.exec_read(id, &command.join(" ")).await?;
    print!("{}", output);
    Ok(())
}
