//! Tunnel configuration data model.
//!
//! A [`TunnelConfig`] describes one desired tunnel: which local endpoint to
//! expose, which relay server to go through, and how the client binary should
//! talk to it. Values are plain data; validation and argument generation live
//! in the daemon.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::relay::RelayServerInfo;

/// Wire protocol used between the client binary and the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Kcp,
    Quic,
    Websocket,
}

impl Protocol {
    /// Every protocol the client binary accepts.
    pub const ALL: [Self; 4] = [Self::Tcp, Self::Kcp, Self::Quic, Self::Websocket];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Kcp => "kcp",
            Self::Quic => "quic",
            Self::Websocket => "websocket",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidValue {
                field: "protocol",
                value: s.to_string(),
            })
    }
}

/// Log verbosity passed to the client binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(Error::InvalidValue {
                field: "log_level",
                value: s.to_string(),
            }),
        }
    }
}

/// Desired tunnel: local endpoint, relay, and client options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local address the exposed service listens on.
    pub local_host: String,
    /// Local port the exposed service listens on.
    pub local_port: u16,
    /// Relay server host name or IP.
    pub server_addr: String,
    /// Relay server control port.
    pub server_port: u16,
    /// Logical proxy/session name registered with the relay.
    pub proxy_name: String,
    pub protocol: Protocol,
    /// Requested public subdomain, if the relay supports it.
    pub subdomain: Option<String>,
    /// Relay authentication token.
    pub token: Option<String>,
    pub use_tls: bool,
    pub use_compression: bool,
    pub use_encryption: bool,
    pub log_level: LogLevel,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            server_addr: String::new(),
            server_port: 7000,
            proxy_name: String::new(),
            protocol: Protocol::default(),
            subdomain: None,
            token: None,
            use_tls: false,
            use_compression: false,
            use_encryption: false,
            log_level: LogLevel::default(),
        }
    }
}

impl TunnelConfig {
    /// Create a config with the required endpoints and defaults for the rest.
    pub fn new(
        local_host: impl Into<String>,
        local_port: u16,
        server_addr: impl Into<String>,
        server_port: u16,
        proxy_name: impl Into<String>,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            server_addr: server_addr.into(),
            server_port,
            proxy_name: proxy_name.into(),
            ..Self::default()
        }
    }

    /// Rebuild this config against another relay, keeping every other field.
    #[must_use]
    pub fn with_relay(&self, relay: &RelayServerInfo) -> Self {
        Self {
            server_addr: relay.address.clone(),
            server_port: relay.port,
            ..self.clone()
        }
    }

    /// `host:port` of the exposed local service.
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// `host:port` of the relay server.
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    /// Whether this config targets the given relay.
    pub fn targets(&self, relay: &RelayServerInfo) -> bool {
        self.server_addr == relay.address && self.server_port == relay.port
    }
}
