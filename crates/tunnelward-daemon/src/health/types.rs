//! Health monitor types.

use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Reachability classification of the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// Result of the most recent health check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub checked_at: Option<SystemTime>,
    pub latency: Option<Duration>,
    /// `host:port` that was probed.
    pub target: Option<String>,
    /// Run the probe belonged to.
    pub run_id: Option<u64>,
    pub consecutive_failures: u32,
    pub message: Option<String>,
}

impl HealthStatus {
    /// Status before any check, or while no URL is known.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub const fn is_healthy(&self) -> bool {
        matches!(self.state, HealthState::Healthy)
    }
}

/// Health monitoring parameters.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Probe timeout.
    pub timeout: Duration,
    /// Successful probes slower than this are `Degraded`.
    pub degraded_latency: Duration,
    /// A running process without a URL for this long is `Unhealthy`.
    pub url_timeout: Duration,
    /// Probe target used when the URL cannot be parsed.
    pub fallback: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            degraded_latency: Duration::from_secs(1),
            url_timeout: Duration::from_secs(30),
            fallback: None,
        }
    }
}
