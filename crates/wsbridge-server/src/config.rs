//! Server configuration: TOML file + CLI overrides.

use crate::policy::PolicyRules;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wsbridge_core::{BridgeError, BridgeResult, ConnectionEntity};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connections: Vec<ConnectionEntity>,
    #[serde(default)]
    pub policies: Vec<PolicyRules>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Runtime worker threads; defaults to the number of cores.
    pub worker_threads: Option<usize>,
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_blocking_threads: default_max_blocking_threads(),
            dial_timeout_secs: default_dial_timeout(),
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_max_blocking_threads() -> usize {
    512
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

impl ConfigFile {
    pub fn parse(content: &str) -> BridgeResult<Self> {
        let file: Self = toml::from_str(content)
            .map_err(|e| BridgeError::Config(format!("config parse error: {e}")))?;
        let mut seen = HashSet::new();
        for entity in &file.connections {
            if !seen.insert(entity.id.as_str()) {
                return Err(BridgeError::Config(format!(
                    "duplicate connection id {:?}",
                    entity.id
                )));
            }
        }
        Ok(file)
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn read(path: &Path) -> BridgeResult<Self> {
        if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

/// Resolved server configuration (path expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub path: PathBuf,
    pub worker_threads: Option<usize>,
    pub max_blocking_threads: usize,
    pub dial_timeout: Duration,
    pub bind_addr: String,
    pub connections: Vec<ConnectionEntity>,
    pub policies: Vec<PolicyRules>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: &Path,
        cli_worker_threads: Option<usize>,
        cli_dial_timeout: Option<u64>,
    ) -> BridgeResult<Self> {
        let path = expand_tilde(config_path);
        let file = ConfigFile::read(&path)?;

        let worker_threads = cli_worker_threads.or(file.server.worker_threads);
        if worker_threads == Some(0) {
            return Err(BridgeError::Config("worker_threads must be at least 1".into()));
        }
        let dial_timeout_secs = cli_dial_timeout.unwrap_or(file.server.dial_timeout_secs);

        Ok(Self {
            path,
            worker_threads,
            max_blocking_threads: file.server.max_blocking_threads.max(1),
            dial_timeout: Duration::from_secs(dial_timeout_secs),
            bind_addr: file.server.bind_addr,
            connections: file.connections,
            policies: file.policies,
        })
    }

    /// Re-read the connection entities from the same file.
    pub fn reload_connections(&self) -> BridgeResult<Vec<ConnectionEntity>> {
        Ok(ConfigFile::read(&self.path)?.connections)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
