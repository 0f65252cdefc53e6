//! Gateway configuration: TOML file + CLI overrides.

use rgate_core::{GateError, GateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub proxy: ProxySection,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Public origin browsers reach the gateway through, e.g.
    /// `https://gw.example.com`. Any explicit port is ignored; the
    /// allocated public port is appended per session.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Address the public listener binds to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port_low")]
    pub port_low: u16,
    #[serde(default = "default_port_high")]
    pub port_high: u16,
    /// Secret handshake path.
    #[serde(default = "default_secret_path")]
    pub secret_path: String,
    /// Name of the session cookie.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            bind_host: default_bind_host(),
            port_low: default_port_low(),
            port_high: default_port_high(),
            secret_path: default_secret_path(),
            cookie_name: default_cookie_name(),
        }
    }
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// End-to-end timeout for one proxied upstream request, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    /// Grace period before a tunnel connection is force-closed, in
    /// milliseconds.
    #[serde(default = "default_close_grace")]
    pub close_grace_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: default_upstream_timeout(),
            close_grace_ms: default_close_grace(),
        }
    }
}

fn default_origin() -> String {
    "http://127.0.0.1".to_string()
}
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port_low() -> u16 {
    42000
}
fn default_port_high() -> u16 {
    42999
}
fn default_secret_path() -> String {
    "/.rgate".to_string()
}
fn default_cookie_name() -> String {
    "rgateToken".to_string()
}
fn default_upstream_timeout() -> u64 {
    30
}
fn default_close_grace() -> u64 {
    1000
}

/// Resolved gateway configuration (origin split, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub public_scheme: String,
    pub public_host: String,
    pub bind_host: String,
    pub port_low: u16,
    pub port_high: u16,
    pub secret_path: String,
    pub cookie_name: String,
    pub upstream_timeout: Duration,
    pub close_grace: Duration,
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_origin: Option<&str>,
        cli_port_low: Option<u16>,
        cli_port_high: Option<u16>,
    ) -> GateResult<Self> {
        // Load base config from file
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        // Merge CLI overrides
        let origin = cli_origin
            .map(|s| s.to_string())
            .unwrap_or(file_config.gateway.origin);
        let port_low = cli_port_low.unwrap_or(file_config.gateway.port_low);
        let port_high = cli_port_high.unwrap_or(file_config.gateway.port_high);

        if port_low > port_high {
            return Err(GateError::Config(format!(
                "invalid port range {port_low}-{port_high}"
            )));
        }

        let (public_scheme, public_host) = split_origin(&origin)?;

        Ok(Self {
            public_scheme,
            public_host,
            bind_host: file_config.gateway.bind_host,
            port_low,
            port_high,
            secret_path: file_config.gateway.secret_path,
            cookie_name: file_config.gateway.cookie_name,
            upstream_timeout: Duration::from_secs(file_config.proxy.upstream_timeout_secs),
            close_grace: Duration::from_millis(file_config.proxy.close_grace_ms),
        })
    }

    /// Public base URL of a gateway instance bound to `public_port`.
    pub fn public_base(&self, public_port: u16) -> String {
        format!(
            "{}://{}:{}",
            self.public_scheme, self.public_host, public_port
        )
    }
}

/// Split an origin like `https://gw.example.com:443` into scheme and bare
/// host. A missing scheme defaults to `http`; an explicit port is dropped.
fn split_origin(origin: &str) -> GateResult<(String, String)> {
    let (scheme, rest) = match origin.split_once("://") {
        Some((s, r)) => (s.to_string(), r),
        None => ("http".to_string(), origin),
    };
    let host = rest
        .split(['/', ':'])
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GateError::Config(format!("invalid public origin: {origin}")))?;
    Ok((scheme, host.to_string()))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(stripped) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(s.as_ref())
}
