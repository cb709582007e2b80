//! Broker configuration: defaults, an optional JSON file, and environment
//! overrides, applied in that order.
//!
//! ```json
//! {
//!   "bind": "0.0.0.0:9000",
//!   "public_url": "wss://broker.example.com",
//!   "max_auth_attempts": 3,
//!   "request_timeout_secs": 30,
//!   "idle_timeout_secs": 300,
//!   "frontend_reconnect_grace_secs": 0,
//!   "closed_linger_secs": 30,
//!   "sweep_interval_secs": 5
//! }
//! ```
//!
//! Every field is optional. Environment variables:
//!
//! - `TETHER_CONFIG` — path of the JSON file to load
//! - `PUBLIC_PORT` — replaces the port in both `bind` and `public_url`
//! - `TETHER_PUBLIC_URL` — replaces `public_url` outright (applied after
//!   `PUBLIC_PORT`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_session::SessionConfig;

pub const CONFIG_PATH_VAR: &str = "TETHER_CONFIG";
pub const PUBLIC_PORT_VAR: &str = "PUBLIC_PORT";
pub const PUBLIC_URL_VAR: &str = "TETHER_PUBLIC_URL";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Everything needed to start a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Socket address to listen on.
    pub bind: String,
    /// Base URL peers reach the broker at; join addresses are built on it.
    pub public_url: String,
    pub max_auth_attempts: u32,
    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub frontend_reconnect_grace_secs: u64,
    pub closed_linger_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            bind: "127.0.0.1:9000".to_string(),
            public_url: "ws://localhost:9000".to_string(),
            max_auth_attempts: session.max_auth_attempts,
            request_timeout_secs: session.request_timeout.as_secs(),
            idle_timeout_secs: session.idle_timeout.as_secs(),
            frontend_reconnect_grace_secs: session
                .frontend_reconnect_grace
                .as_secs(),
            closed_linger_secs: session.closed_linger.as_secs(),
            sweep_interval_secs: session.sweep_interval.as_secs(),
        }
    }
}

impl BrokerConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the file named by `TETHER_CONFIG` (if set), then
    /// `PUBLIC_PORT` and `TETHER_PUBLIC_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) => {
                tracing::info!(%path, "loading config file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    /// Applies `PUBLIC_PORT` and `TETHER_PUBLIC_URL` from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(PUBLIC_PORT_VAR) {
            let port: u16 =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: PUBLIC_PORT_VAR,
                    value: value.clone(),
                })?;
            self.bind = replace_port(&self.bind, port);
            self.public_url = replace_url_port(&self.public_url, port);
        }
        if let Some(url) = lookup(PUBLIC_URL_VAR) {
            self.public_url = url;
        }
        Ok(())
    }

    /// The session timeouts and limits as a [`SessionConfig`].
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_auth_attempts: self.max_auth_attempts,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            frontend_reconnect_grace: Duration::from_secs(
                self.frontend_reconnect_grace_secs,
            ),
            closed_linger: Duration::from_secs(self.closed_linger_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

/// `host:port` → `host:{port}`. A bare host gets the port appended.
fn replace_port(authority: &str, port: u16) -> String {
    let host = match authority.rsplit_once(':') {
        // `[::1]` alone has colons but no port.
        Some((host, tail)) if !tail.contains(']') => host,
        _ => authority,
    };
    format!("{host}:{port}")
}

/// `scheme://host[:port][/path]` with the port replaced.
fn replace_url_port(url: &str, port: u16) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let authority = replace_port(authority, port);
    match scheme {
        Some(scheme) => format!("{scheme}://{authority}{path}"),
        None => format!("{authority}{path}"),
    }
}
