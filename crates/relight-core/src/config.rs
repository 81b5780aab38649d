//! relight.toml configuration parser.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default idle period before a VM is paused.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Shortest idle period accepted by [`RelightConfig::validate`].
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time a request waits for a paused VM to resume.
pub const DEFAULT_WAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between idle watcher ticks.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);
/// Default port the app listens on inside each VM.
pub const DEFAULT_APP_PORT: u16 = 8080;
/// Default proxy listen address.
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8081);

/// Environment variable that overrides `control_plane.token`.
pub const TOKEN_ENV: &str = "RELIGHT_TOKEN";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("idle_timeout must be at least {}s", MIN_IDLE_TIMEOUT.as_secs())]
    IdleTimeoutTooShort,

    #[error("app_port must be between 1 and 65535, got {0}")]
    InvalidPort(u32),

    #[error("unsupported control plane scheme in {0:?}; use http://, https:// or a socket path")]
    UnsupportedScheme(String),

    #[error("cannot expand ~ without a HOME directory")]
    NoHomeDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelightConfig {
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// HTTP URL (`http://127.0.0.1:8080`) or Unix socket path
    /// (`~/slicer/slicer.sock`, `/var/run/slicer.sock`).
    pub url: String,
    #[serde(default)]
    pub token: String,
    /// Host group containing the app VMs.
    pub host_group: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default, with = "crate::duration::serde_opt")]
    pub idle_timeout: Option<Duration>,
    #[serde(default, with = "crate::duration::serde_opt")]
    pub wake_timeout: Option<Duration>,
    #[serde(default, with = "crate::duration::serde_opt")]
    pub watch_interval: Option<Duration>,
    pub app_port: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<SocketAddr>,
    /// Address for the on-demand TLS ask responder. Disabled when unset.
    pub ask_listen: Option<SocketAddr>,
}

/// Where the control plane API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneEndpoint {
    /// Plain HTTP over TCP.
    Http {
        /// `host:port` to dial.
        connect_addr: String,
        /// Value for the `Host` header.
        authority: String,
        /// Path prefix prepended to every request, without trailing `/`.
        base_path: String,
    },
    /// HTTP over TLS.
    Https {
        /// `host:port` to dial.
        connect_addr: String,
        /// Value for the `Host` header.
        authority: String,
        /// Host name sent as SNI and checked against the certificate.
        server_name: String,
        /// Path prefix prepended to every request, without trailing `/`.
        base_path: String,
    },
    /// HTTP over a Unix domain socket.
    Unix { path: PathBuf },
}

impl ControlPlaneEndpoint {
    /// Classify a configured URL. Anything without a scheme is treated as
    /// a socket path, with a leading `~/` expanded.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("https://") {
            let (authority, base_path) = split_authority(rest)?;
            return Ok(Self::Https {
                connect_addr: with_default_port(authority, 443),
                server_name: host_of(authority).to_string(),
                authority: authority.to_string(),
                base_path,
            });
        }
        if let Some(rest) = raw.strip_prefix("http://") {
            let (authority, base_path) = split_authority(rest)?;
            return Ok(Self::Http {
                connect_addr: with_default_port(authority, 80),
                authority: authority.to_string(),
                base_path,
            });
        }
        if raw.contains("://") {
            return Err(ConfigError::UnsupportedScheme(raw.to_string()));
        }

        let path = match raw.strip_prefix("~/") {
            Some(rest) => {
                let home = std::env::var_os("HOME").ok_or(ConfigError::NoHomeDir)?;
                PathBuf::from(home).join(rest)
            }
            None => PathBuf::from(raw),
        };
        Ok(Self::Unix { path })
    }
}

/// Split `host:port/prefix/` into the authority and a prefix without the
/// trailing `/`.
fn split_authority(rest: &str) -> Result<(&str, String), ConfigError> {
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(ConfigError::Missing("control_plane.url host"));
    }
    Ok((authority, path.trim_end_matches('/').to_string()))
}

fn with_default_port(authority: &str, port: u16) -> String {
    if has_port(authority) {
        authority.to_string()
    } else {
        format!("{authority}:{port}")
    }
}

/// Host part of an authority, without port or IPv6 brackets.
fn host_of(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rfind(':') {
        Some(idx) => &authority[..idx],
        None => authority,
    }
}

fn has_port(authority: &str) -> bool {
    match authority.rfind(':') {
        Some(idx) => !authority[idx..].contains(']'),
        None => false,
    }
}

impl RoutingConfig {
    pub fn idle_timeout(&self) -> Duration {
        or_default(self.idle_timeout, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn wake_timeout(&self) -> Duration {
        or_default(self.wake_timeout, DEFAULT_WAKE_TIMEOUT)
    }

    pub fn watch_interval(&self) -> Duration {
        or_default(self.watch_interval, DEFAULT_WATCH_INTERVAL)
    }

    pub fn app_port(&self) -> u16 {
        match self.app_port {
            Some(0) | None => DEFAULT_APP_PORT,
            Some(p) => u16::try_from(p).unwrap_or(DEFAULT_APP_PORT),
        }
    }
}

impl ServerConfig {
    /// Proxy listen address, `0.0.0.0:8081` unless configured.
    pub fn listen(&self) -> SocketAddr {
        self.listen.unwrap_or(DEFAULT_LISTEN)
    }
}

/// Zero counts as unset.
fn or_default(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|d| !d.is_zero()).unwrap_or(default)
}

impl RelightConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides (currently only the API token).
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            self.control_plane.token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_plane.url.trim().is_empty() {
            return Err(ConfigError::Missing("control_plane.url"));
        }
        if self.control_plane.token.is_empty() {
            return Err(ConfigError::Missing("control_plane.token"));
        }
        if self.control_plane.host_group.is_empty() {
            return Err(ConfigError::Missing("control_plane.host_group"));
        }
        if self.routing.idle_timeout() < MIN_IDLE_TIMEOUT {
            return Err(ConfigError::IdleTimeoutTooShort);
        }
        if let Some(port) = self.routing.app_port
            && port > u32::from(u16::MAX)
        {
            return Err(ConfigError::InvalidPort(port));
        }
        self.endpoint()?;
        Ok(())
    }

    pub fn endpoint(&self) -> Result<ControlPlaneEndpoint, ConfigError> {
        ControlPlaneEndpoint::parse(&self.control_plane.url)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
