//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Daemon configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of the CPU this daemon serves.
    /// Override: `MEDIAD_CPU`
    pub cpu: String,

    /// Directory for the control-plane unix sockets.
    /// Override: `MEDIAD_SOCKET_DIR`
    pub socket_dir: PathBuf,

    /// TCP port for cross-CPU traffic (negative disables).
    /// Override: `MEDIAD_RPC_PORT`
    pub rpc_port: i32,

    /// Optional extra inet listener for tools (negative disables).
    pub inet_port: i32,

    /// Peer CPU name to host address.
    pub peers: HashMap<String, String>,

    /// Focus interaction-matrix resource file. Unset uses the built-in
    /// matrix.
    pub focus_conf: Option<PathBuf>,

    /// File backing `persist.media.*` criteria. Unset keeps them in memory.
    /// Override: `MEDIAD_PERSIST_FILE`
    pub persist_file: Option<PathBuf>,

    /// Debounce window for persisted criterion writes, in milliseconds.
    pub persist_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = mediad_core::Config::default();
        Self {
            cpu: core.transport.local_cpu,
            socket_dir: core.transport.socket_dir,
            rpc_port: core.transport.rpc_port,
            inet_port: core.transport.inet_port,
            peers: core.transport.peers,
            focus_conf: None,
            persist_file: None,
            persist_delay_ms: core.persist_delay_ms,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEDIAD_CPU") {
            if !val.is_empty() {
                self.cpu = val;
            }
        }

        if let Ok(val) = std::env::var("MEDIAD_SOCKET_DIR") {
            if !val.is_empty() {
                self.socket_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = std::env::var("MEDIAD_RPC_PORT") {
            if let Ok(port) = val.parse() {
                self.rpc_port = port;
            }
        }

        // MEDIAD_PERSIST_FILE is handled by clap via #[arg(env = ...)].
    }

    /// Converts to mediad-core's Config type.
    pub fn to_core_config(&self) -> mediad_core::Config {
        let mut config = mediad_core::Config::default();
        config.transport.local_cpu = self.cpu.clone();
        config.transport.socket_dir = self.socket_dir.clone();
        config.transport.rpc_port = self.rpc_port;
        config.transport.inet_port = self.inet_port;
        config.transport.peers = self.peers.clone();
        config.focus_conf = self.focus_conf.clone();
        config.persist_path = self.persist_file.clone();
        config.persist_delay_ms = self.persist_delay_ms;
        config
    }
}
