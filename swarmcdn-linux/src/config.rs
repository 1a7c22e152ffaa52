//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use swarmcdn_core::ResolverConfig;

/// Daemon configuration. File: ~/.config/swarmcdn/config.toml or /etc/swarmcdn/config.toml.
/// Env overrides: SWARMCDN_PROXY_PORT, SWARMCDN_TRANSPORT_PORT, SWARMCDN_PEERS, SWARMCDN_P2P_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Player endpoint listen port (default 8090).
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Peer transport TCP port (default 45680).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Peers to connect to at startup. There is no discovery; peers can also dial us.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Origin HTTP timeout in seconds (default 30).
    #[serde(default = "default_origin_timeout_secs")]
    pub origin_timeout_secs: u64,
    /// How long to wait for a peer offer before using the origin (default 1500 ms).
    #[serde(default = "default_p2p_timeout_ms")]
    pub p2p_timeout_ms: u64,
    /// Number of chunks kept in memory (default 4).
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Refetch a resource after serving it from cache (default true).
    #[serde(default = "default_refetch_on_cache_hit")]
    pub refetch_on_cache_hit: bool,
}

fn default_proxy_port() -> u16 {
    8090
}
fn default_transport_port() -> u16 {
    45680
}
fn default_origin_timeout_secs() -> u64 {
    30
}
fn default_p2p_timeout_ms() -> u64 {
    1500
}
fn default_cache_size() -> usize {
    swarmcdn_core::MAX_CACHE_SIZE
}
fn default_refetch_on_cache_hit() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            transport_port: default_transport_port(),
            peers: Vec::new(),
            origin_timeout_secs: default_origin_timeout_secs(),
            p2p_timeout_ms: default_p2p_timeout_ms(),
            cache_size: default_cache_size(),
            refetch_on_cache_hit: default_refetch_on_cache_hit(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            cache_capacity: self.cache_size,
            p2p_timeout: self.p2p_timeout(),
            refetch_on_cache_hit: self.refetch_on_cache_hit,
        }
    }

    pub fn p2p_timeout(&self) -> Duration {
        Duration::from_millis(self.p2p_timeout_ms)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_secs)
    }

    /// Apply overrides from `var` (normally `std::env::var`). Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("SWARMCDN_PROXY_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.proxy_port = p;
        }
        if let Some(p) = var("SWARMCDN_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.transport_port = p;
        }
        if let Some(s) = var("SWARMCDN_PEERS") {
            let peers: Option<Vec<SocketAddr>> = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse().ok())
                .collect();
            match peers {
                Some(peers) => self.peers = peers,
                None => tracing::warn!(value = %s, "ignoring unparseable SWARMCDN_PEERS"),
            }
        }
        if let Some(ms) = var("SWARMCDN_P2P_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.p2p_timeout_ms = ms;
        }
    }
}

/// Error reading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/swarmcdn/config.toml"));
    }
    out.push(PathBuf::from("/etc/swarmcdn/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => {
            tracing::info!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "using default config");
            None
        }
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path)?;
    Config::from_toml_str(&s)
}
