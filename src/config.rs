use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Container runtime used to build and run sandboxes
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl SandboxRuntime {
    /// Name of the CLI binary for this runtime.
    pub fn binary(&self) -> &'static str {
        match self {
            SandboxRuntime::Docker => "docker",
            SandboxRuntime::Podman => "podman",
        }
    }
}

/// Configuration for sandboxd, read from ~/.config/sandboxd/config.yaml
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Address the HTTP API listens on. Default: 127.0.0.1:4000
    #[serde(default)]
    pub bind: Option<SocketAddr>,

    /// Container runtime. Default: docker
    #[serde(default)]
    pub runtime: Option<SandboxRuntime>,

    /// Value of the `project` label stamped on every sandbox. Default: "december"
    #[serde(default)]
    pub project_label: Option<String>,

    /// First port tried when allocating a host port. Default: 8000
    #[serde(default)]
    pub base_port: Option<u16>,

    /// Number of candidate ports scanned from `base_port`. Default: 1000
    #[serde(default)]
    pub port_window: Option<u16>,

    /// Port the web app listens on inside the sandbox. Default: 3000
    #[serde(default)]
    pub app_port: Option<u16>,

    /// Source root inside the sandbox. Default: /app/src
    #[serde(default)]
    pub source_root: Option<String>,

    /// Prefix for image and container names. Default: "dec-nextjs"
    #[serde(default)]
    pub name_prefix: Option<String>,

    /// Host used in sandbox URLs handed back to clients. Default: localhost
    #[serde(default)]
    pub public_host: Option<String>,

    /// Path to a custom Dockerfile template. Uses the embedded one if not set.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,

    /// Timeout for short engine calls in seconds. Default: 60
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,

    /// Timeout for image builds in seconds. Default: 900
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,

    /// Attempts made when the engine is unreachable. Default: 3
    #[serde(default)]
    pub retry_attempts: Option<u32>,
}

impl Config {
    pub fn bind(&self) -> SocketAddr {
        self.bind
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 4000)))
    }

    pub fn runtime(&self) -> SandboxRuntime {
        self.runtime.unwrap_or_default()
    }

    pub fn project_label(&self) -> &str {
        self.project_label.as_deref().unwrap_or("december")
    }

    pub fn base_port(&self) -> u16 {
        self.base_port.unwrap_or(8000)
    }

    /// Never zero, a window of zero would make every allocation fail.
    pub fn port_window(&self) -> u16 {
        self.port_window.unwrap_or(1000).max(1)
    }

    pub fn app_port(&self) -> u16 {
        self.app_port.unwrap_or(3000)
    }

    /// Source root without a trailing slash.
    pub fn source_root(&self) -> &str {
        let root = self.source_root.as_deref().unwrap_or("/app/src");
        match root.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        }
    }

    pub fn name_prefix(&self) -> &str {
        self.name_prefix.as_deref().unwrap_or("dec-nextjs")
    }

    pub fn public_host(&self) -> &str {
        self.public_host.as_deref().unwrap_or("localhost")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.unwrap_or(60))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs.unwrap_or(900))
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.unwrap_or(3).max(1)
    }

    /// Load configuration from an explicit path, or from the global config
    /// location when no path is given. Missing files yield defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        debug!(path = ?path, "config:loading");
        let config = match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                Self::load_from_path(path)?
            }
            None => Self::load_global()?,
        }
        .unwrap_or_default();

        debug!(
            runtime = ?config.runtime(),
            project = config.project_label(),
            base_port = config.base_port(),
            "config:loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from the XDG config directory.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            let xdg_config_path = home_dir.join(".config/sandboxd/config.yaml");
            if xdg_config_path.exists() {
                return Self::load_from_path(&xdg_config_path);
            }
            let xdg_config_path_yml = home_dir.join(".config/sandboxd/config.yml");
            if xdg_config_path_yml.exists() {
                return Self::load_from_path(&xdg_config_path_yml);
            }
        }
        Ok(None)
    }
}
