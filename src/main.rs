mod cli;
mod cmd;
mod command;
mod config;
mod engine;
mod error;
mod logger;
mod sandbox;
mod server;
mod template;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logger::init(cli.logs_to_stderr())?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "sandboxd start");

    match cli::run(cli).await {
        Ok(result) => {
            info!("sandboxd finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "sandboxd failed");
            Err(err)
        }
    }
}
