//! # Driver Configuration
//!
//! Purpose: Describe where to connect and how long blocking operations may
//! take. A `Config` is read once by `connect` and never mutated by a driver.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;

/// Transport used to reach the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Tcp,
    Unix,
}

/// TCP keepalive tuning, applied only where the platform supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpKeepalive {
    /// Idle seconds before the first probe.
    pub time: u32,
    /// Seconds between probes.
    pub intvl: u32,
    /// Unanswered probes before the connection is dropped.
    pub probes: u32,
}

/// Connection settings for a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Socket path for the `unix` scheme.
    pub path: Option<PathBuf>,
    /// Timeout in seconds for connect, write and read. Absent or `<= 0`
    /// disables the timeout.
    pub timeout: Option<f64>,
    pub tcp_keepalive: Option<TcpKeepalive>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scheme: Scheme::Tcp,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: None,
            timeout: None,
            tcp_keepalive: None,
        }
    }
}

impl Config {
    /// TCP config for `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Unix socket config for `path`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Config {
            scheme: Scheme::Unix,
            path: Some(path.into()),
            ..Config::default()
        }
    }

    /// Sets the timeout in seconds.
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_keepalive(mut self, keepalive: TcpKeepalive) -> Self {
        self.tcp_keepalive = Some(keepalive);
        self
    }

    /// The timeout as a `Duration`, or `None` when disabled.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.and_then(seconds_to_duration)
    }

    /// Checks that the fields required by the scheme are present.
    pub fn validate(&self) -> DriverResult<()> {
        match self.scheme {
            Scheme::Tcp if self.host.is_empty() => {
                Err(DriverError::InvalidConfig("tcp scheme requires a host".to_string()))
            }
            Scheme::Unix if self.path.is_none() => {
                Err(DriverError::InvalidConfig("unix scheme requires a path".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Parses `redis://host[:port]`, `tcp://host[:port]` or `unix:///path`.
    ///
    /// IPv6 hosts use brackets: `redis://[::1]:6379`. Anything after the
    /// authority (database index, query) is ignored.
    pub fn from_url(url: &str) -> DriverResult<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| DriverError::InvalidConfig(format!("missing scheme in {url:?}")))?;

        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(DriverError::InvalidConfig("unix url requires a path".to_string()));
                }
                Ok(Config::unix(rest))
            }
            "redis" | "tcp" => {
                let authority = rest.split(['/', '?']).next().unwrap_or_default();
                // Credentials are not part of the transport layer.
                let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
                let (host, port) = split_host_port(authority)?;
                Ok(Config::tcp(host, port))
            }
            other => Err(DriverError::InvalidConfig(format!("unsupported scheme {other:?}"))),
        }
    }
}

/// Converts fractional seconds to a microsecond-resolution duration.
///
/// Zero, negative, NaN and infinite values mean "no timeout".
pub fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round();
    if micros < 1.0 {
        return Some(Duration::from_micros(1));
    }
    if micros >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_micros(micros as u64))
}

fn split_host_port(authority: &str) -> DriverResult<(String, u16)> {
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| DriverError::InvalidConfig(format!("unterminated IPv6 host {authority:?}")))?;
        (host, tail.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    let port = match port {
        Some(port) => port
            .parse()
            .map_err(|_| DriverError::InvalidConfig(format!("invalid port {port:?}")))?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_string(), port))
}
