//! Composite tunnel status.
//!
//! Folds the process, URL, health, relay and recovery snapshots into the one
//! view external callers consume. The fold is pure; a background task
//! recomputes it whenever a constituent changes.

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tunnelward_core::RelayServerInfo;

use crate::health::{HealthState, HealthStatus};
use crate::process::{ProcessState, ProcessStatus, TunnelUrlInfo};
use crate::reconnect::{RecoveryPhase, RecoveryState};

/// Externally visible tunnel phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum TunnelPhase {
    Stopped,
    Starting,
    /// Running, but no URL yet or health not yet positive.
    Connecting,
    Online,
    Degraded,
    Reconnecting { attempt: u32, max_attempts: u32 },
    FailingOver,
    /// No further automatic recovery.
    Failed { reason: String },
}

impl std::fmt::Display for TunnelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Connecting => write!(f, "connecting"),
            Self::Online => write!(f, "online"),
            Self::Degraded => write!(f, "degraded"),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting, attempt {attempt} of {max_attempts}"),
            Self::FailingOver => write!(f, "failing over"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Read-only view of the whole tunnel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeStatus {
    pub phase: TunnelPhase,
    pub process: Option<ProcessStatus>,
    pub health: HealthStatus,
    pub url: Option<TunnelUrlInfo>,
    pub relay: Option<RelayServerInfo>,
    pub reconnect_attempt: u32,
    pub max_attempts: u32,
    pub updated_at: SystemTime,
}

/// Fold constituent snapshots into a composite status.
///
/// URL and health snapshots that belong to an earlier run are ignored.
pub fn fold(
    process: Option<&ProcessStatus>,
    url: Option<&TunnelUrlInfo>,
    health: &HealthStatus,
    relay: Option<&RelayServerInfo>,
    recovery: &RecoveryState,
) -> CompositeStatus {
    let run_id = process.map(|p| p.run_id);
    let url = url.filter(|u| Some(u.run_id) == run_id);
    let health = if health.run_id == run_id {
        health.clone()
    } else {
        HealthStatus::unknown()
    };

    let phase = match &recovery.phase {
        RecoveryPhase::Failed { reason } => TunnelPhase::Failed {
            reason: reason.clone(),
        },
        RecoveryPhase::FailingOver => TunnelPhase::FailingOver,
        RecoveryPhase::Reconnecting {
            attempt,
            max_attempts,
        } => TunnelPhase::Reconnecting {
            attempt: *attempt,
            max_attempts: *max_attempts,
        },
        RecoveryPhase::Idle => match process.map(|p| p.state) {
            None | Some(ProcessState::Stopped) => TunnelPhase::Stopped,
            Some(ProcessState::Starting) => TunnelPhase::Starting,
            Some(ProcessState::Running) => match (url, health.state) {
                (Some(_), HealthState::Healthy) => TunnelPhase::Online,
                (Some(_), HealthState::Degraded) => TunnelPhase::Degraded,
                _ => TunnelPhase::Connecting,
            },
        },
    };

    CompositeStatus {
        phase,
        process: process.cloned(),
        health,
        url: url.cloned(),
        relay: relay.cloned(),
        reconnect_attempt: recovery.attempt,
        max_attempts: recovery.max_attempts,
        updated_at: SystemTime::now(),
    }
}

/// Keeps a composite status current.
pub struct StatusAggregator {
    process_rx: watch::Receiver<Option<Arc<ProcessStatus>>>,
    url_rx: watch::Receiver<Option<Arc<TunnelUrlInfo>>>,
    health_rx: watch::Receiver<Arc<HealthStatus>>,
    relay_rx: watch::Receiver<Option<RelayServerInfo>>,
    recovery_rx: watch::Receiver<RecoveryState>,
    status_tx: watch::Sender<Arc<CompositeStatus>>,
}

impl StatusAggregator {
    pub fn new(
        process_rx: watch::Receiver<Option<Arc<ProcessStatus>>>,
        url_rx: watch::Receiver<Option<Arc<TunnelUrlInfo>>>,
        health_rx: watch::Receiver<Arc<HealthStatus>>,
        relay_rx: watch::Receiver<Option<RelayServerInfo>>,
        recovery_rx: watch::Receiver<RecoveryState>,
    ) -> Self {
        let initial = fold(None, None, &HealthStatus::unknown(), None, &RecoveryState::default());
        let (status_tx, _) = watch::channel(Arc::new(initial));
        let aggregator = Self {
            process_rx,
            url_rx,
            health_rx,
            relay_rx,
            recovery_rx,
            status_tx,
        };
        aggregator.status_tx.send_replace(Arc::new(aggregator.status()));
        aggregator
    }

    /// Current composite status, folded from the latest snapshots.
    pub fn status(&self) -> CompositeStatus {
        let process = self.process_rx.borrow().clone();
        let url = self.url_rx.borrow().clone();
        let health = Arc::clone(&self.health_rx.borrow());
        let relay = self.relay_rx.borrow().clone();
        let recovery = self.recovery_rx.borrow().clone();
        fold(
            process.as_deref(),
            url.as_deref(),
            &health,
            relay.as_ref(),
            &recovery,
        )
    }

    pub fn watch_status(&self) -> watch::Receiver<Arc<CompositeStatus>> {
        self.status_tx.subscribe()
    }

    /// Recompute on every constituent change until aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    async fn run(self: Arc<Self>) {
        let mut process_rx = self.process_rx.clone();
        let mut url_rx = self.url_rx.clone();
        let mut health_rx = self.health_rx.clone();
        let mut relay_rx = self.relay_rx.clone();
        let mut recovery_rx = self.recovery_rx.clone();

        loop {
            let changed = tokio::select! {
                r = process_rx.changed() => r,
                r = url_rx.changed() => r,
                r = health_rx.changed() => r,
                r = relay_rx.changed() => r,
                r = recovery_rx.changed() => r,
            };
            if changed.is_err() {
                break;
            }
            process_rx.mark_unchanged();
            url_rx.mark_unchanged();
            health_rx.mark_unchanged();
            relay_rx.mark_unchanged();
            recovery_rx.mark_unchanged();

            let status = self.status();
            let phase_changed = self.status_tx.borrow().phase != status.phase;
            if phase_changed {
                debug!(phase = %status.phase, "Tunnel phase changed");
            }
            self.status_tx.send_replace(Arc::new(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tunnelward_core::TunnelConfig;

    use super::*;
    use crate::process::ExitReason;

    fn running(run_id: u64) -> ProcessStatus {
        let config = TunnelConfig::new("127.0.0.1", 5000, "relay.example", 7000, "p1");
        ProcessStatus::starting(run_id, config).running(Some(10))
    }

    fn url(run_id: u64) -> TunnelUrlInfo {
        TunnelUrlInfo {
            url: "https://p1.relay.example".into(),
            run_id,
            detected_at: SystemTime::now(),
        }
    }

    fn health(run_id: u64, state: HealthState) -> HealthStatus {
        HealthStatus {
            state,
            run_id: Some(run_id),
            latency: Some(Duration::from_millis(5)),
            ..HealthStatus::unknown()
        }
    }

    fn idle() -> RecoveryState {
        RecoveryState {
            max_attempts: 5,
            ..RecoveryState::default()
        }
    }

    #[test]
    fn stopped_without_process() {
        let status = fold(None, None, &HealthStatus::unknown(), None, &idle());
        assert_eq!(status.phase, TunnelPhase::Stopped);
        assert_eq!(status.max_attempts, 5);
    }

    #[test]
    fn running_phases() {
        let p = running(1);
        let phase = |u: Option<&TunnelUrlInfo>, h: HealthState| {
            fold(Some(&p), u, &health(1, h), None, &idle()).phase
        };
        assert_eq!(phase(None, HealthState::Unknown), TunnelPhase::Connecting);
        assert_eq!(phase(Some(&url(1)), HealthState::Unknown), TunnelPhase::Connecting);
        assert_eq!(phase(Some(&url(1)), HealthState::Unhealthy), TunnelPhase::Connecting);
        assert_eq!(phase(Some(&url(1)), HealthState::Healthy), TunnelPhase::Online);
        assert_eq!(phase(Some(&url(1)), HealthState::Degraded), TunnelPhase::Degraded);
    }

    #[test]
    fn stale_url_and_health_are_dropped() {
        let p = running(2);
        let status = fold(Some(&p), Some(&url(1)), &health(1, HealthState::Healthy), None, &idle());
        assert_eq!(status.phase, TunnelPhase::Connecting);
        assert!(status.url.is_none());
        assert_eq!(status.health.state, HealthState::Unknown);
    }

    #[test]
    fn recovery_phase_takes_priority() {
        let p = running(1).stopped(Some(1), ExitReason::Unexpected);
        let recovery = RecoveryState {
            phase: RecoveryPhase::Reconnecting {
                attempt: 2,
                max_attempts: 5,
            },
            attempt: 2,
            max_attempts: 5,
        };
        let status = fold(Some(&p), None, &HealthStatus::unknown(), None, &recovery);
        assert_eq!(status.phase.to_string(), "reconnecting, attempt 2 of 5");
        assert_eq!(status.reconnect_attempt, 2);

        let failed = RecoveryState {
            phase: RecoveryPhase::Failed {
                reason: "no alternate relay".into(),
            },
            ..recovery
        };
        let status = fold(Some(&p), None, &HealthStatus::unknown(), None, &failed);
        assert!(matches!(status.phase, TunnelPhase::Failed { .. }));
    }

    #[test]
    fn serializes_phase_tag() {
        let status = fold(None, None, &HealthStatus::unknown(), None, &idle());
        let json = serde_json::to_value(&status).unwrap_or_default();
        assert_eq!(json["phase"]["phase"], "stopped");
    }

    #[tokio::test]
    async fn republishes_on_change() {
        let (process_tx, process_rx) = watch::channel(None);
        let (_url_tx, url_rx) = watch::channel(None);
        let (_health_tx, health_rx) = watch::channel(Arc::new(HealthStatus::unknown()));
        let (_relay_tx, relay_rx) = watch::channel(None);
        let (_recovery_tx, recovery_rx) = watch::channel(idle());
        let aggregator = Arc::new(StatusAggregator::new(
            process_rx,
            url_rx,
            health_rx,
            relay_rx,
            recovery_rx,
        ));
        let mut rx = aggregator.watch_status();
        let task = aggregator.spawn();

        process_tx.send_replace(Some(Arc::new(running(1))));
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.borrow_and_update().phase != TunnelPhase::Connecting {
                rx.changed().await.ok();
            }
        })
        .await
        .ok();
        assert_eq!(aggregator.status().phase, TunnelPhase::Connecting);
        assert_eq!(rx.borrow().phase, TunnelPhase::Connecting);
        task.abort();
    }
}
