//! Relay server candidates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Last-known health of a relay server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayHealth {
    #[default]
    Unknown,
    Healthy,
    Failed,
}

/// A relay server the tunnel client can connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayServerInfo {
    pub address: String,
    pub port: u16,
    /// Geographic region label (e.g. "eu-west"), if known.
    #[serde(default)]
    pub region: Option<String>,
    /// Performance/preference score; higher is better.
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub health: RelayHealth,
}

impl RelayServerInfo {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            region: None,
            score: 0.0,
            health: RelayHealth::Unknown,
        }
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    #[must_use]
    pub const fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Whether two entries describe the same server, ignoring score and health.
    pub fn same_server(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for RelayServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
