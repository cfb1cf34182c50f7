//! Container engine boundary.
//!
//! The engine is the only source of truth for which sandboxes exist. This
//! module defines the operations the rest of the crate needs from it and the
//! typed parsing of its listing output.

mod docker;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::warn;

use crate::error::{Result, SandboxError};

pub use docker::DockerEngine;

/// Everything needed to launch one detached sandbox instance.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub host_port: u16,
    pub app_port: u16,
    /// Host directory bind-mounted read-write into the instance.
    pub mount_source: PathBuf,
    pub mount_target: String,
    pub labels: BTreeMap<String, String>,
}

/// One row of the engine's container listing, after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRow {
    pub id: String,
    pub name: String,
    /// Machine state when the engine reports one (`running`, `exited`, ...).
    pub state: Option<String>,
    /// Free-form status text (`Up 3 minutes`, `Exited (0) 2 hours ago`).
    pub status_text: String,
    /// Host ports published by the instance, in listing order.
    pub host_ports: Vec<u16>,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<String>,
}

/// Captured result of a command executed inside an instance.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Operations the sandbox core needs from a container engine.
///
/// Implementations must be Send + Sync to allow sharing via Arc<dyn Engine>.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the name of this engine (e.g., "docker", "podman")
    fn name(&self) -> &'static str;

    /// Check whether the engine daemon answers at all
    async fn ping(&self) -> Result<bool>;

    /// Build an image from `context`, tagging it `tag`. Returns the captured build output.
    async fn build(&self, context: &Path, tag: &str) -> Result<String>;

    /// Start a detached instance. Returns the engine's instance id.
    async fn run(&self, spec: &RunSpec) -> Result<String>;

    /// Start a stopped instance
    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// List all instances (running or not) carrying the `key=value` label
    async fn list(&self, label_filter: &str) -> Result<Vec<EngineRow>>;

    /// Labels attached to an instance. `NotFound` if the instance does not exist.
    async fn inspect_labels(&self, id: &str) -> Result<BTreeMap<String, String>>;

    /// Copy a host file to `dest` inside the instance
    async fn copy_in(&self, src: &Path, id: &str, dest: &str) -> Result<()>;

    /// Run a command inside the instance. A non-zero exit is reported through
    /// `ExecOutput`, not as an error.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput>;

    /// Combined stdout and stderr of the instance
    async fn logs(&self, id: &str) -> Result<String>;

    /// Tar stream of the directory `path` inside the instance
    async fn archive(&self, id: &str, path: &str) -> Result<Vec<u8>>;
}

// ── Listing parser ──────────────────────────────────────────────────────

static HOST_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)->\d+").expect("valid host port regex"));

/// Docker reports `Names` as a string, podman as a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NamesField {
    One(String),
    Many(Vec<String>),
}

/// Docker reports `Labels` as `k=v,k=v` text, podman as a map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelsField {
    Text(String),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Deserialize)]
struct PodmanPort {
    host_port: u16,
}

/// Docker reports `Ports` as text, podman as structured mappings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortsField {
    Text(String),
    Mappings(Vec<PodmanPort>),
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "ID", alias = "Id")]
    id: String,
    #[serde(rename = "Names")]
    names: NamesField,
    #[serde(rename = "State", default)]
    state: Option<String>,
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Ports", default)]
    ports: Option<PortsField>,
    #[serde(rename = "Labels", default)]
    labels: Option<LabelsField>,
    #[serde(rename = "CreatedAt", default)]
    created_at: Option<String>,
}

/// Extract every published host port from a ports column such as
/// `0.0.0.0:8001->3000/tcp, [::]:8001->3000/tcp`. Duplicates are dropped.
pub fn parse_host_ports(text: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for cap in HOST_PORT_RE.captures_iter(text) {
        if let Ok(port) = cap[1].parse::<u16>()
            && !ports.contains(&port)
        {
            ports.push(port);
        }
    }
    ports
}

/// Parse a `k=v,k=v` label column. Entries without `=` are kept with an empty value.
pub fn parse_label_text(text: &str) -> BTreeMap<String, String> {
    text.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

/// Parse one JSON listing row.
pub fn parse_row(line: &str) -> Result<EngineRow> {
    let raw: RawRow = serde_json::from_str(line)
        .map_err(|e| SandboxError::MalformedOutput(format!("{}: {}", e, line)))?;

    let name = match raw.names {
        NamesField::One(name) => name,
        NamesField::Many(names) => names.into_iter().next().unwrap_or_default(),
    };
    let host_ports = match raw.ports {
        Some(PortsField::Text(text)) => parse_host_ports(&text),
        Some(PortsField::Mappings(mappings)) => {
            mappings.into_iter().map(|m| m.host_port).collect()
        }
        None => Vec::new(),
    };
    let labels = match raw.labels {
        Some(LabelsField::Text(text)) => parse_label_text(&text),
        Some(LabelsField::Map(map)) => map,
        None => BTreeMap::new(),
    };

    Ok(EngineRow {
        id: raw.id,
        name: name.trim_start_matches('/').to_string(),
        state: raw.state.map(|s| s.to_lowercase()),
        status_text: raw.status.unwrap_or_default(),
        host_ports,
        labels,
        created_at: raw.created_at,
    })
}

/// Parse NDJSON listing output (one JSON object per line).
///
/// Rows that fail to parse are skipped with a warning so one odd row cannot
/// hide every other sandbox.
pub fn parse_rows(stdout: &str) -> Vec<EngineRow> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match parse_row(l) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(error = %e, "engine:list skipping malformed row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_ROW: &str = r#"{"Command":"\"docker-entrypoint.s…\"","CreatedAt":"2025-03-01 10:00:00 +0000 UTC","ID":"0f3c9a","Image":"dec-nextjs-abc","Labels":"assignedPort=8001,project=december","Names":"dec-nextjs-abc","Ports":"0.0.0.0:8001->3000/tcp, [::]:8001->3000/tcp","State":"running","Status":"Up 3 minutes"}"#;

    const PODMAN_ROW: &str = r#"{"Id":"77aa","Names":["dec-nextjs-def"],"State":"exited","Status":"Exited (0) 2 minutes ago","Ports":[{"host_ip":"","container_port":3000,"host_port":8002,"range":1,"protocol":"tcp"}],"Labels":{"project":"december","assignedPort":"8002"}}"#;

    #[test]
    fn test_parse_host_ports() {
        assert_eq!(
            parse_host_ports("0.0.0.0:8001->3000/tcp, [::]:8001->3000/tcp"),
            vec![8001]
        );
        assert_eq!(
            parse_host_ports("0.0.0.0:8001->3000/tcp, 0.0.0.0:9229->9229/tcp"),
            vec![8001, 9229]
        );
        assert!(parse_host_ports("3000/tcp").is_empty());
        assert!(parse_host_ports("").is_empty());
    }

    #[test]
    fn test_parse_label_text() {
        let labels = parse_label_text("assignedPort=8001,project=december,flag");
        assert_eq!(labels.get("assignedPort").map(String::as_str), Some("8001"));
        assert_eq!(labels.get("project").map(String::as_str), Some("december"));
        assert_eq!(labels.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_docker_row() {
        let row = parse_row(DOCKER_ROW).unwrap();
        assert_eq!(row.id, "0f3c9a");
        assert_eq!(row.name, "dec-nextjs-abc");
        assert_eq!(row.state.as_deref(), Some("running"));
        assert_eq!(row.status_text, "Up 3 minutes");
        assert_eq!(row.host_ports, vec![8001]);
        assert_eq!(row.labels.get("project").map(String::as_str), Some("december"));
        assert!(row.created_at.is_some());
    }

    #[test]
    fn test_parse_podman_row() {
        let row = parse_row(PODMAN_ROW).unwrap();
        assert_eq!(row.id, "77aa");
        assert_eq!(row.name, "dec-nextjs-def");
        assert_eq!(row.state.as_deref(), Some("exited"));
        assert_eq!(row.host_ports, vec![8002]);
        assert_eq!(row.labels.get("assignedPort").map(String::as_str), Some("8002"));
    }

    #[test]
    fn test_parse_row_rejects_garbage() {
        assert!(matches!(
            parse_row("CONTAINER ID   NAMES"),
            Err(SandboxError::MalformedOutput(_))
        ));
        assert!(parse_row(r#"{"Names":"x"}"#).is_err());
    }

    #[test]
    fn test_parse_rows_skips_bad_lines_and_blanks() {
        let stdout = format!("{}\n\nnot json\n{}\n", DOCKER_ROW, PODMAN_ROW);
        let rows = parse_rows(&stdout);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "0f3c9a");
        assert_eq!(rows[1].id, "77aa");
    }

    #[test]
    fn test_parse_rows_empty_output() {
        assert!(parse_rows("").is_empty());
        assert!(parse_rows("\n").is_empty());
    }
}
