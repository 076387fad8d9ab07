//! Reachability probes.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use url::{Host, Url};

use crate::error::{Result, TunnelError};

/// Host and port a probe connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Target for a tunnel URL: its host plus the explicit port or the
    /// scheme's default. `None` when the URL has neither.
    pub fn from_url(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        let host = match url.host()? {
            Host::Domain(d) => d.to_string(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        if host.is_empty() {
            return None;
        }
        let port = url.port_or_known_default()?;
        Some(Self { host, port })
    }

    /// Parse a `host:port` endpoint.
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        let (host, port) = endpoint.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A single reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probe `target`, returning the measured latency.
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration>;
}

/// Probe that succeeds when a TCP connection can be opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((target.host.as_str(), target.port)))
            .await
        {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(TunnelError::HealthCheckFailed(format!(
                "connect to {target} failed: {e}"
            ))),
            Err(_) => Err(TunnelError::HealthCheckFailed(format!(
                "connect to {target} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn target_from_https_url_uses_default_port() {
        assert_eq!(
            ProbeTarget::from_url("https://p1.relay.example/path").unwrap(),
            ProbeTarget::new("p1.relay.example", 443)
        );
        assert_eq!(
            ProbeTarget::from_url("http://p1.relay.example").unwrap().port,
            80
        );
    }

    #[test]
    fn target_from_tcp_url_needs_port() {
        assert_eq!(
            ProbeTarget::from_url("tcp://relay.example:40123").unwrap(),
            ProbeTarget::new("relay.example", 40123)
        );
        assert!(ProbeTarget::from_url("tcp://relay.example").is_none());
        assert!(ProbeTarget::from_url("not a url").is_none());
    }

    #[test]
    fn ipv6_round_trip() {
        let target = ProbeTarget::from_url("http://[::1]:8080").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.to_string(), "[::1]:8080");
        assert_eq!(ProbeTarget::from_endpoint("[::1]:8080").unwrap(), target);
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            ProbeTarget::from_endpoint("127.0.0.1:5000").unwrap(),
            ProbeTarget::new("127.0.0.1", 5000)
        );
        assert!(ProbeTarget::from_endpoint("127.0.0.1").is_none());
        assert!(ProbeTarget::from_endpoint(":80").is_none());
    }

    #[tokio::test]
    async fn tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let latency = TcpProbe
            .probe(&ProbeTarget::new("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn tcp_probe_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpProbe
            .probe(&ProbeTarget::new("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::HealthCheckFailed(_)));
    }
}
