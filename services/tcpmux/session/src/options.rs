//! Connect, listen, and TLS options.
//!
//! Everything here is checked synchronously, before any transport work
//! starts, so configuration mistakes surface as `BadConfig`/`BadParam`
//! results instead of asynchronous error events.

use crate::error::{Result, SocketError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 50;

/// Options for outbound connections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectOptions {
    /// Local address to bind before connecting
    pub local_address: Option<String>,
    /// Local port to bind before connecting
    pub local_port: Option<u16>,
    /// SO_REUSEADDR on the local socket (default true)
    pub reuse_address: Option<bool>,
    /// Disable Nagle's algorithm once connected
    pub no_delay: Option<bool>,
    /// Deadline applied to every write on this connection
    #[serde(with = "humantime_serde")]
    pub send_timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Whether SO_REUSEADDR should be set
    pub fn reuse_address(&self) -> bool {
        self.reuse_address.unwrap_or(true)
    }

    /// Parse the local bind address, if any
    pub(crate) fn local_ip(&self) -> Result<Option<IpAddr>> {
        match self.local_address.as_deref() {
            None => Ok(None),
            Some(addr) => addr
                .parse::<IpAddr>()
                .map(Some)
                .map_err(|_| SocketError::BadConfig(format!("invalid local address: {}", addr))),
        }
    }

    /// Local address to bind for a connection towards `remote`
    pub(crate) fn local_bind(&self, remote: &SocketAddr) -> Result<Option<SocketAddr>> {
        let ip = self.local_ip()?;
        if ip.is_none() && self.local_port.is_none() {
            return Ok(None);
        }

        let ip = ip.unwrap_or(match remote {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        if ip.is_ipv4() != remote.is_ipv4() {
            return Err(SocketError::BadConfig(format!(
                "local address {} does not match the family of {}",
                ip, remote
            )));
        }
        Ok(Some(SocketAddr::new(ip, self.local_port.unwrap_or(0))))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.local_ip().map(|_| ())
    }
}

/// Options for listening sockets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenOptions {
    /// Bind host
    #[serde(default = "default_listen_host")]
    pub host: String,
    /// Bind port, 0 picks any free port
    pub port: u16,
    /// SO_REUSEADDR on the listening socket
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    /// Accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Server TLS context; when set, accepted sockets are TLS
    #[serde(default)]
    pub tls: Option<TlsServerOptions>,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

impl ListenOptions {
    /// Listen on `host:port` with default settings
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reuse_address: true,
            backlog: DEFAULT_BACKLOG,
            tls: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SocketError::BadConfig("listen host is required".to_string()));
        }
        if self.backlog == 0 {
            return Err(SocketError::BadConfig("listen backlog must be positive".to_string()));
        }
        Ok(())
    }
}

/// Client-side TLS options (also used for `start_tls`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    /// PEM trust anchors used to verify the peer
    #[serde(default)]
    pub ca: Option<String>,
    /// PEM certificate chain (client auth, or server identity on accepted sockets)
    #[serde(default)]
    pub cert: Option<String>,
    /// PEM private key matching `cert`
    #[serde(default)]
    pub key: Option<String>,
    /// Name used for SNI and certificate verification, defaults to the host
    #[serde(default)]
    pub server_name: Option<String>,
    /// Verify the peer certificate
    #[serde(default = "default_true")]
    pub check_validity: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            server_name: None,
            check_validity: true,
        }
    }
}

impl TlsOptions {
    /// Options that skip peer verification entirely
    pub fn insecure() -> Self {
        Self {
            check_validity: false,
            ..Self::default()
        }
    }

    /// Certificate and key, both present or both absent
    pub(crate) fn identity(&self) -> Result<Option<(&str, &str)>> {
        match (self.cert.as_deref(), self.key.as_deref()) {
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            (None, None) => Ok(None),
            _ => Err(SocketError::BadConfig(
                "tls cert and key must be given together".to_string(),
            )),
        }
    }
}

/// Server-side TLS context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsServerOptions {
    /// PEM certificate chain
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// PEM CA used to require and verify client certificates
    #[serde(default)]
    pub ca: Option<String>,
}

/// Check host and port of an outbound connection
pub(crate) fn validate_endpoint(host: &str, port: u16) -> Result<()> {
    if host.trim().is_empty() {
        return Err(SocketError::BadParam("host must not be empty".to_string()));
    }
    if port == 0 {
        return Err(SocketError::BadParam("port must be in 1..=65535".to_string()));
    }
    Ok(())
}
