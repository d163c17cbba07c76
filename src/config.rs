//! Configuration file support for pingpong-rs.
//!
//! One TOML file with a section per role:
//! - `[server]` ping-pong server options (listen address, TLS files, registration)
//! - `[client]` client options (direct URL or registry lookup)
//! - `[registry]` registry options (bind address, lease and ticket lifetimes)
//!
//! Every field is optional; command line flags override file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default WebTransport port.
pub const DEFAULT_PORT: u16 = 4433;

/// Default listen host (all interfaces, dual stack).
pub const DEFAULT_HOST: &str = "::";

/// Default registry address.
pub const DEFAULT_REGISTRY_BIND: &str = "0.0.0.0:9999";

/// Capability every ping-pong server offers.
pub const CAP_PING_PONG: &str = "ping-pong";

/// Capability for datagram echo.
pub const CAP_DATAGRAM_ECHO: &str = "datagram-echo";

/// Ping-pong server section.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub server_id: Option<String>,
    pub advertise_url: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub require_ticket: Option<bool>,
    pub registry: Option<String>,
    pub heartbeat_secs: Option<u64>,
}

/// Client section.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub url: Option<String>,
    pub cert_hash: Option<String>,
    pub registry: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub connect_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Registry section.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    pub bind: Option<SocketAddr>,
    pub lease_ttl_secs: Option<u64>,
    pub ticket_ttl_secs: Option<u64>,
}

/// Whole configuration file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<ServerSection>,
    pub client: Option<ClientSection>,
    pub registry: Option<RegistrySection>,
}

// ============================================================================
// Config Accessor Methods
// ============================================================================

impl FileConfig {
    /// Get server section, with defaults.
    pub fn server(&self) -> ServerSection {
        self.server.clone().unwrap_or_default()
    }

    /// Get client section, with defaults.
    pub fn client(&self) -> ClientSection {
        self.client.clone().unwrap_or_default()
    }

    /// Get registry section, with defaults.
    pub fn registry(&self) -> RegistrySection {
        self.registry.clone().unwrap_or_default()
    }
}

impl ServerSection {
    /// Listen address from host and port (`::` and `[::]` both accepted).
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = self.host.as_deref().unwrap_or(DEFAULT_HOST);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip: std::net::IpAddr = host
            .parse()
            .with_context(|| format!("Invalid listen host '{}': expected an IP address", host))?;
        Ok(SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_PORT)))
    }

    /// Capabilities to advertise; always includes ping-pong.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = self
            .capabilities
            .clone()
            .unwrap_or_else(|| vec![CAP_PING_PONG.to_string(), CAP_DATAGRAM_ECHO.to_string()]);
        if !caps.iter().any(|c| c == CAP_PING_PONG) {
            caps.insert(0, CAP_PING_PONG.to_string());
        }
        caps
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(10).max(1))
    }
}

impl ClientSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(10).max(1))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3).max(1)
    }
}

impl RegistrySection {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind.unwrap_or_else(|| {
            DEFAULT_REGISTRY_BIND
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9999)))
        })
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.unwrap_or(30).max(1))
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs.unwrap_or(15).max(1))
    }
}

// ============================================================================
// Config Loading
// ============================================================================

/// Load configuration from a TOML file.
fn load_config<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve the default config path (~/.config/pingpong-rs/config.toml).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pingpong-rs").join("config.toml"))
}

/// Load configuration from an explicit path, or from the default location.
///
/// - `path`: Some(path) loads from the specified path (must exist)
/// - `path`: None loads the default file if present, otherwise empty config
pub fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(p) => load_config(p),
        None => match default_config_path() {
            Some(p) if p.exists() => load_config(&p),
            _ => Ok(FileConfig::default()),
        },
    }
}
