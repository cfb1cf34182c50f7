use anyhow::Result;
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::config::Config;
use crate::server;

pub async fn run(config: &Config, bind: Option<SocketAddr>) -> Result<()> {
    let sandboxes = super::load_sandboxes(config)?;
    match sandboxes.engine_ready().await {
        Ok(true) => match sandboxes.list().await {
            Ok(existing) => info!(count = existing.len(), "serve:found existing sandboxes"),
            Err(e) => warn!(error = %e, "serve:could not list existing sandboxes"),
        },
        Ok(false) => warn!(engine = sandboxes.engine_name(), "serve:engine not answering yet"),
        Err(e) => warn!(error = %e, "serve:engine check failed"),
    }

    let bind = bind.unwrap_or_else(|| config.bind());
    println!("sandboxd listening on http://{}", bind);
    server::serve(bind, sandboxes).await
}
