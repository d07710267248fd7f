use serde::{Deserialize, Serialize};
use stashio_core::{Result, StashError};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub env: Env,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Dev,
    Prod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request timeout for data-plane transfers, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Seconds between health-check dispatches.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Peer to bootstrap ring membership from on startup.
    #[serde(default)]
    pub sync_node: Option<String>,

    /// Seed members (semicolon-separated in env form).
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Announce this node to every known member after sync.
    #[serde(default)]
    pub announce_new: bool,

    /// Address peers reach this node at. Defaults to 127.0.0.1:{port}.
    #[serde(default)]
    pub advertise_addr: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout: default_timeout(),
            health_check_interval: default_health_check_interval(),
            sync_node: None,
            nodes: Vec::new(),
            announce_new: false,
            advertise_addr: None,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Number of nodes that should hold each blob; 0 and 1 both mean
    /// primary-only.
    #[serde(default)]
    pub replication_factor: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            replication_factor: 0,
        }
    }
}

fn default_port() -> u16 {
    5555
}

fn default_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./stash/")
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("STASHIO")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(";")
                    .with_list_parse_key("rpc.nodes"),
            )
            .build()
            .map_err(|e| StashError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| StashError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn validate(&self) {
        if self.rpc.nodes.is_empty() && self.rpc.sync_node.is_none() {
            tracing::warn!("neither rpc.nodes nor rpc.sync_node is configured");
        }
    }
}
