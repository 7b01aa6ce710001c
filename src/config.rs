//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags**: applied by `main` after [`Config::load`]
//! 2. **Environment variables**: `LTBROKER_LISTEN`, `LTBROKER_DOMAIN`,
//!    `LTBROKER_SECURE`, `LTBROKER_MAX_SOCKETS`
//! 3. **Config file**: path via `--config <path>`, or `ltbroker.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:80"
//! domain = "tunnel.example.com"   # optional; omit to derive from Host
//! secure = false                  # public URLs use https when true
//!
//! [tunnel]
//! bind_address = "0.0.0.0"        # where per-tunnel listeners bind
//! max_sockets = 10                # pooled connections per remote client
//! grace_period_ms = 1000          # teardown delay without a live socket
//! borrow_timeout_ms = 10000       # wait for a socket on an empty pool
//! socket_idle_timeout_secs = 300  # 0 disables
//! max_header_bytes = 65536        # upgrade response head limit
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default file looked up in the working directory when no path is given.
const DEFAULT_CONFIG_FILE: &str = "ltbroker.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Public HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:80`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base domain tunnels live under (`<id>.<domain>`). When unset, the
    /// tunnel id is taken from the Host header's leftmost label and URLs are
    /// built from the request's own Host.
    #[serde(default)]
    pub domain: Option<String>,
    /// Whether the broker sits behind TLS termination. Controls the URL
    /// scheme handed to clients and the injected `X-Forwarded-Proto`.
    #[serde(default)]
    pub secure: bool,
}

/// Per-tunnel pool and proxy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Address each tunnel's dedicated listener binds to (default `0.0.0.0`).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum sockets a remote client may hold in one pool (default 10).
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    /// Grace period in milliseconds before a tunnel with no live socket is
    /// torn down (default 1000).
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// How long a request waits for a socket on an empty pool (default 10 000).
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,
    /// Read-inactivity timeout on borrowed sockets in seconds (default 300,
    /// 0 = disabled). Upgraded connections always clear it.
    #[serde(default = "default_socket_idle_timeout_secs")]
    pub socket_idle_timeout_secs: u64,
    /// Upper bound on a backend's upgrade response head (default 64 KiB).
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:80".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_max_sockets() -> usize {
    10
}
fn default_grace_period_ms() -> u64 {
    1000
}
fn default_borrow_timeout_ms() -> u64 {
    10_000
}
fn default_socket_idle_timeout_secs() -> u64 {
    300
}
fn default_max_header_bytes() -> usize {
    64 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            domain: None,
            secure: false,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_sockets: default_max_sockets(),
            grace_period_ms: default_grace_period_ms(),
            borrow_timeout_ms: default_borrow_timeout_ms(),
            socket_idle_timeout_secs: default_socket_idle_timeout_secs(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }

    /// `None` when the idle timeout is disabled.
    pub fn socket_idle_timeout(&self) -> Option<Duration> {
        (self.socket_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.socket_idle_timeout_secs))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `ltbroker.toml` in the current directory is used when present, falling
    /// back to compiled defaults.
    ///
    /// The result is not validated: command-line flags still apply on top, so
    /// call [`Config::validate`] once every layer is in.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: PathBuf::from(path),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Apply `LTBROKER_*` overrides. The lookup is injected so tests don't
    /// touch the process environment.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("LTBROKER_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(domain) = var("LTBROKER_DOMAIN") {
            self.server.domain = Some(domain).filter(|d| !d.is_empty());
        }
        if let Some(secure) = var("LTBROKER_SECURE") {
            self.server.secure = matches!(secure.as_str(), "1" | "true" | "yes");
        }
        if let Some(max) = var("LTBROKER_MAX_SOCKETS").and_then(|v| v.parse().ok()) {
            self.tunnel.max_sockets = max;
        }
    }

    /// Reject settings the tunnel engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.max_sockets == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.max_sockets must be at least 1".to_string(),
            ));
        }
        if self.tunnel.grace_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.grace_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.tunnel.max_header_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "tunnel.max_header_bytes must be at least 1024".to_string(),
            ));
        }
        Ok(())
    }
}
