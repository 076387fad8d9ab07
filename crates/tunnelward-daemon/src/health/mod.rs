//! Tunnel reachability monitoring.
//!
//! A running client process does not mean the tunnel works: the relay-side
//! connection can break while the process stays alive. The monitor probes the
//! public URL (or the local endpoint as a fallback) on a schedule.

pub mod monitor;
pub mod probe;
pub mod types;

pub use monitor::HealthMonitor;
pub use probe::{Probe, ProbeTarget, TcpProbe};
pub use types::{HealthConfig, HealthState, HealthStatus};
