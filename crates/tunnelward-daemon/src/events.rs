//! Typed event hub shared by all supervisor components.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;
use tunnelward_core::RelayServerInfo;

use crate::health::HealthStatus;
use crate::process::{ProcessStatus, TunnelUrlInfo};
use crate::reconnect::ReconnectionAttempt;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// State-change messages published by the supervisor components.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// Process state transition. Published in transition order.
    StatusChanged(Arc<ProcessStatus>),
    /// A URL was parsed from the client output (first or changed).
    UrlDetected(Arc<TunnelUrlInfo>),
    /// The process exited without being asked to.
    ProcessExited {
        status: Arc<ProcessStatus>,
        output_tail: Vec<String>,
    },
    HealthChecked(Arc<HealthStatus>),
    ReconnectionAttempted(ReconnectionAttempt),
    /// Failover switched the active relay.
    RelayChanged(RelayServerInfo),
    /// Automatic recovery gave up.
    RecoveryFailed { reason: String },
}

impl TunnelEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged(_) => "status_changed",
            Self::UrlDetected(_) => "url_detected",
            Self::ProcessExited { .. } => "process_exited",
            Self::HealthChecked(_) => "health_checked",
            Self::ReconnectionAttempted(_) => "reconnection_attempted",
            Self::RelayChanged(_) => "relay_changed",
            Self::RecoveryFailed { .. } => "recovery_failed",
        }
    }
}

/// Broadcast hub. Cloning yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<TunnelEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn publish(&self, event: TunnelEvent) {
        let kind = event.kind();
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(kind, receivers, "Event published");
    }
}
