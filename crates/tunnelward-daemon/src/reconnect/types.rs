//! Reconnection bookkeeping types.

use std::time::{Duration, SystemTime};

use serde::Serialize;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// Retry with backoff.
    Transient,
    /// Retry, counting more heavily toward failover.
    ServerUnreachable,
    /// Stop retrying and surface the error.
    Fatal,
}

/// What became of a reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    /// Waiting for its backoff delay.
    Pending,
    /// The client was restarted; recovery not yet confirmed.
    Restarted,
    /// A later health check of the restarted run passed.
    Recovered,
    Failed,
    /// Superseded by a deliberate stop.
    Cancelled,
}

/// One scheduled restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectionAttempt {
    /// Attempt counter value after this failure was counted.
    pub seq: u32,
    pub delay: Duration,
    pub classification: FailureClass,
    pub outcome: AttemptOutcome,
    pub at: SystemTime,
}

/// Reconnection phase, as seen by the status aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum RecoveryPhase {
    #[default]
    Idle,
    Reconnecting { attempt: u32, max_attempts: u32 },
    FailingOver,
    Failed { reason: String },
}

/// Snapshot of the reconnection manager's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryState {
    pub phase: RecoveryPhase,
    /// Weighted failure count against the current relay.
    pub attempt: u32,
    pub max_attempts: u32,
}
