//! `tunnelward` Daemon Library
//!
//! Supervises a third-party reverse-tunnel client end to end:
//! - Platform binary resolution and checksum validation
//! - Client process lifecycle and public URL extraction
//! - Reachability health checks
//! - Reconnection with backoff and relay failover
//! - A composite status view over all of the above

pub mod binary;
pub mod error;
pub mod events;
pub mod failover;
pub mod generator;
pub mod health;
pub mod process;
pub mod reconnect;
pub mod settings;
pub mod status;
pub mod supervisor;

pub use error::{Result, TunnelError};
pub use events::{EventHub, TunnelEvent};
pub use status::{CompositeStatus, TunnelPhase};
pub use supervisor::{SupervisorOptions, TunnelSupervisor};
