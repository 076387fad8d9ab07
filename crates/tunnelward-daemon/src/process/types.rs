//! Process supervisor snapshot types.

use std::time::{Duration, SystemTime};

use serde::Serialize;
use tunnelward_core::TunnelConfig;

/// Lifecycle state of the client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    /// Stopped by `stop`/`restart`.
    Requested,
    /// Exited on its own.
    Unexpected,
}

/// Immutable snapshot of one run of the client process.
///
/// A new value is published on every transition; holders of an older
/// snapshot keep a consistent view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    /// Monotonic per supervisor; identifies which run this snapshot describes.
    pub run_id: u64,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub exited_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<ExitReason>,
    pub config: TunnelConfig,
}

impl ProcessStatus {
    pub(crate) fn starting(run_id: u64, config: TunnelConfig) -> Self {
        Self {
            run_id,
            state: ProcessState::Starting,
            pid: None,
            started_at: None,
            exited_at: None,
            exit_code: None,
            exit_reason: None,
            config,
        }
    }

    pub(crate) fn running(&self, pid: Option<u32>) -> Self {
        Self {
            state: ProcessState::Running,
            pid,
            started_at: Some(SystemTime::now()),
            ..self.clone()
        }
    }

    pub(crate) fn stopped(&self, exit_code: Option<i32>, reason: ExitReason) -> Self {
        Self {
            state: ProcessState::Stopped,
            exited_at: Some(SystemTime::now()),
            exit_code,
            exit_reason: Some(reason),
            ..self.clone()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Time since the process was observed running, if it is.
    pub fn uptime(&self) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        self.started_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
    }
}

/// Public URL reported by the client for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelUrlInfo {
    pub url: String,
    pub run_id: u64,
    pub detected_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_replace_fields() {
        let config = TunnelConfig::new("127.0.0.1", 5000, "relay.example", 7000, "p1");
        let starting = ProcessStatus::starting(3, config);
        assert_eq!(starting.state, ProcessState::Starting);
        assert!(starting.uptime().is_none());

        let running = starting.running(Some(42));
        assert!(running.is_running());
        assert_eq!(running.pid, Some(42));
        assert!(running.started_at.is_some());

        let stopped = running.stopped(Some(1), ExitReason::Unexpected);
        assert!(!stopped.is_running());
        assert_eq!(stopped.run_id, 3);
        assert_eq!(stopped.pid, Some(42));
        assert_eq!(stopped.exit_code, Some(1));
        assert_eq!(stopped.exit_reason, Some(ExitReason::Unexpected));
        assert_eq!(starting.state, ProcessState::Starting);
    }
}
