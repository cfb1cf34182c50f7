//! Host port allocation for sandbox instances.
//!
//! A port counts as taken when this process reserved it (the instance may
//! not be bound yet), when a running sandbox of this project publishes it
//! according to the engine, or when any other process on the host holds it.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::engine::Engine;
use crate::error::{Result, SandboxError};

/// Checks whether a host port is free of unrelated listeners.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Probes by briefly binding the port on all interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_free(&self, port: u16) -> bool {
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::AddrInUse => false,
            // Anything else says nothing about other listeners; assume free.
            Err(e) => {
                debug!(port, error = %e, "ports:probe inconclusive");
                true
            }
        }
    }
}

pub struct PortAllocator {
    engine: Arc<dyn Engine>,
    probe: Arc<dyn PortProbe>,
    label_filter: String,
    window: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(
        engine: Arc<dyn Engine>,
        probe: Arc<dyn PortProbe>,
        project_label: &str,
        window: u16,
    ) -> Self {
        Self {
            engine,
            probe,
            label_filter: format!("{}={}", super::PROJECT_LABEL, project_label),
            window: window.max(1),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Ports published by running sandboxes of this project.
    ///
    /// Best-effort: if the engine cannot be listed, only local reservations
    /// and the host probe protect the scan.
    async fn engine_bound_ports(&self) -> HashSet<u16> {
        match self.engine.list(&self.label_filter).await {
            Ok(rows) => rows
                .into_iter()
                .filter(|row| super::SandboxStatus::from_row(row) == super::SandboxStatus::Running)
                .flat_map(|row| {
                    let mut ports = row.host_ports;
                    if let Some(port) = super::assigned_port(&row.labels) {
                        ports.push(port);
                    }
                    ports
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "ports:engine listing failed, relying on local state");
                HashSet::new()
            }
        }
    }

    /// Reserve the first free port at or above `preferred_start`.
    ///
    /// The whole scan-and-claim runs under the reservation lock, so concurrent
    /// callers never receive the same port.
    pub async fn reserve(&self, preferred_start: u16) -> Result<u16> {
        let mut reserved = self.reserved.lock().await;
        let bound = self.engine_bound_ports().await;

        let start = u32::from(preferred_start.max(1));
        let end = start + u32::from(self.window);
        for candidate in start..end.min(u32::from(u16::MAX) + 1) {
            let port = candidate as u16;
            if reserved.contains(&port) || bound.contains(&port) {
                continue;
            }
            if !self.probe.is_free(port).await {
                trace!(port, "ports:held by another process");
                continue;
            }
            reserved.insert(port);
            info!(port, "ports:reserved");
            return Ok(port);
        }

        warn!(start, end, "ports:exhausted");
        Err(SandboxError::ResourceExhaustion {
            start: preferred_start,
            end,
        })
    }

    /// Drop a local reservation. Releasing a port that is not reserved is a no-op.
    pub async fn release(&self, port: u16) -> bool {
        let removed = self.reserved.lock().await.remove(&port);
        if removed {
            info!(port, "ports:released");
        }
        removed
    }

    /// Snapshot of the current local reservations.
    #[cfg(test)]
    pub async fn reserved(&self) -> std::collections::BTreeSet<u16> {
        self.reserved.lock().await.iter().copied().collect()
    }
}
