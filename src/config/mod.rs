//! Service configuration, read from a JSON file.
//!
//! ```json
//! {
//!   "server": { "server_type": "unix", "local_host": "/run/httpcache.sock",
//!               "remote_host": "/run/backend.sock", "diag_host": "/run/httpcache-diag.sock" },
//!   "proxy": { "no_of_workers": 0 },
//!   "skip_cache_apis": ["login/", "logout/"]
//! }
//! ```
//!
//! Every field is optional.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::proxy::{
    BackendAddr, DEFAULT_BACKPRESSURE_MARGIN, DEFAULT_QUEUE_CAPACITY, DispatcherOptions,
    default_worker_count,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/httpcache/apis.json";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_ENV: &str = "HTTPCACHE_CONFIG";

/// Prefixes every skip-listed API is expanded under.
pub const API_LEVELS: &[&str] = &["/", "/api/v1/", "/api/v2/", "/api/v3/", "/api/v4/"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the service listens for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Http,
    Unix,
}

/// How the backend is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Unix,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Start with diagnose logging on.
    pub diagnose: bool,
    pub server_type: ServerType,
    /// Socket path when `server_type` is `unix`, bind host when `http`.
    pub local_host: String,
    pub port: u16,
    pub remote_type: RemoteType,
    /// Backend socket path, or `host:port` for a TCP backend.
    pub remote_host: String,
    /// Diagnostic session socket; empty disables it.
    pub diag_host: String,
    pub read_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            diagnose: false,
            server_type: ServerType::Http,
            local_host: "0.0.0.0".to_owned(),
            port: 8098,
            remote_type: RemoteType::Unix,
            remote_host: "/var/run/httpcache-backend.sock".to_owned(),
            diag_host: String::new(),
            read_timeout_secs: 15,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Zero means three workers per available core.
    pub no_of_workers: usize,
    pub queue_capacity: usize,
    pub backpressure_margin: usize,
    pub auth_scheme: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            no_of_workers: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backpressure_margin: DEFAULT_BACKPRESSURE_MARGIN,
            auth_scheme: "X-HTTPCACHE-AUTH".to_owned(),
        }
    }
}

impl ProxyConfig {
    pub fn worker_count(&self) -> usize {
        match self.no_of_workers {
            0 => default_worker_count(),
            n => n,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub skip_cache_apis: Vec<String>,
    /// Form value carrying the request-key.
    pub request_key_param: String,
    /// Where the diagnostic `dump-stats` command writes.
    pub dump_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            skip_cache_apis: Vec::new(),
            request_key_param: "uuid".to_owned(),
            dump_file: PathBuf::from("/tmp/dump-stats-httpCache.json"),
        }
    }
}

impl Config {
    /// Reads and validates the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.queue_capacity <= self.proxy.backpressure_margin {
            return Err(ConfigError::Invalid(format!(
                "proxy.queue_capacity ({}) must exceed proxy.backpressure_margin ({})",
                self.proxy.queue_capacity, self.proxy.backpressure_margin
            )));
        }
        if self.request_key_param.is_empty() {
            return Err(ConfigError::Invalid(
                "request_key_param must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Skip-listed APIs expanded under every entry of [`API_LEVELS`].
    pub fn skip_set(&self) -> HashSet<String> {
        API_LEVELS
            .iter()
            .flat_map(|level| {
                self.skip_cache_apis
                    .iter()
                    .map(move |api| format!("{level}{api}"))
            })
            .collect()
    }

    pub fn backend_addr(&self) -> BackendAddr {
        match self.server.remote_type {
            RemoteType::Unix => BackendAddr::Unix(PathBuf::from(&self.server.remote_host)),
            RemoteType::Tcp => BackendAddr::Tcp(self.server.remote_host.clone()),
        }
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            workers: self.proxy.worker_count(),
            queue_capacity: self.proxy.queue_capacity,
            backpressure_margin: self.proxy.backpressure_margin,
            auth_scheme: self.proxy.auth_scheme.clone(),
            key_param: self.request_key_param.clone(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}
