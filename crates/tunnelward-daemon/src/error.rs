//! Tunnel supervisor error types.

use std::path::PathBuf;

/// Result alias for supervisor operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors surfaced by the tunnel supervisor.
///
/// Configuration, binary and spawn errors are returned synchronously from
/// `start`/`restart`. The runtime variants describe failures that the
/// reconnection layer handles internally and only reports once terminal.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid tunnel config: {0}")]
    ConfigInvalid(String),

    #[error("No client binary for {platform} at {}", path.display())]
    BinaryNotFound { platform: String, path: PathBuf },

    #[error("Client binary {} is invalid: {reason}", path.display())]
    BinaryInvalid { path: PathBuf, reason: String },

    #[error("Failed to spawn client process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Client process exited unexpectedly (code {code:?})")]
    ProcessExitedUnexpectedly { code: Option<i32> },

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("No alternate relay server available")]
    NoAlternateRelay,

    #[error("Restart requested before any tunnel was started")]
    NoPriorConfig,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether the error came from the caller's input or environment rather
    /// than from a running tunnel.
    pub const fn is_synchronous(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid(_)
                | Self::BinaryNotFound { .. }
                | Self::BinaryInvalid { .. }
                | Self::ProcessSpawnFailed(_)
                | Self::NoPriorConfig
        )
    }
}
