//! `tunnelward` Core Library
//!
//! Shared functionality for `tunnelward` components:
//! - Tunnel and relay data model
//! - Settings resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod relay;
pub mod tracing_init;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
pub use relay::{RelayHealth, RelayServerInfo};
pub use tunnel::{LogLevel, Protocol, TunnelConfig};
