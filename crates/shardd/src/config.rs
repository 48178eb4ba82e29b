//! `shardd.toml` configuration file (spec.md §6's configuration surface),
//! mirroring `warp-core::config::WarpConfig::from_file`.

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_conns_per_backend() -> usize {
    4
}

fn default_workers_per_backend() -> usize {
    4
}

fn default_client_workers() -> usize {
    64
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_mapper() -> String {
    "read-one-write-all".to_string()
}

/// On-disk configuration, loaded with `toml`+`serde`. Every field mirrors a
/// CLI flag of the same name; CLI flags take precedence when both are given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// A literal `host[:port] ...` list, mutually exclusive with `backend_file`.
    pub backends: Option<String>,
    /// Path to a file holding the same whitespace-separated backend list,
    /// re-read on every `SIGUSR1`/`SIGUSR2`.
    pub backend_file: Option<String>,

    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: Option<String>,

    #[serde(default = "default_conns_per_backend")]
    pub conns_per_backend: usize,
    #[serde(default = "default_workers_per_backend")]
    pub workers_per_backend: usize,
    #[serde(default = "default_client_workers")]
    pub client_workers: usize,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_mapper")]
    pub mapper: String,
    #[serde(default)]
    pub autocommit: bool,
    #[serde(default)]
    pub two_pc: bool,
    #[serde(default)]
    pub add_ids: bool,
}

impl ShardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShardConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
